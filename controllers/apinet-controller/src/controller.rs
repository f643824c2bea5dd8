//! Main controller implementation.
//!
//! Builds the store clients and the shared [`Reconciler`], then runs one
//! watcher task per kind until one of them exits or the process is
//! interrupted.

use apinet_client::KubeClient;
use futures::future::select_all;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::reconciler::certificate::KubeCsrApproval;
use crate::reconciler::{Clients, Reconciler};
use crate::watcher::Watcher;

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Internal-store controller manager.
#[derive(Debug)]
pub struct Controller {
    watchers: Vec<(&'static str, WatcherHandle)>,
    cancel: CancellationToken,
}

fn clients(client: &Client) -> Clients {
    Clients {
        networks: Arc::new(KubeClient::namespaced(client.clone())),
        network_ids: Arc::new(KubeClient::cluster(client.clone())),
        ips: Arc::new(KubeClient::namespaced(client.clone())),
        ip_addresses: Arc::new(KubeClient::cluster(client.clone())),
        network_interfaces: Arc::new(KubeClient::namespaced(client.clone())),
        load_balancers: Arc::new(KubeClient::namespaced(client.clone())),
        nat_gateways: Arc::new(KubeClient::namespaced(client.clone())),
        nat_tables: Arc::new(KubeClient::namespaced(client.clone())),
        nat_gateway_autoscalers: Arc::new(KubeClient::namespaced(client.clone())),
        network_policies: Arc::new(KubeClient::namespaced(client.clone())),
        network_policy_rules: Arc::new(KubeClient::namespaced(client.clone())),
        daemon_sets: Arc::new(KubeClient::namespaced(client.clone())),
        instances: Arc::new(KubeClient::namespaced(client.clone())),
        nodes: Arc::new(KubeClient::cluster(client.clone())),
        csr_approval: Arc::new(KubeCsrApproval::new(client.clone())),
    }
}

fn spawn<F>(name: &'static str, fut: F) -> (&'static str, WatcherHandle)
where
    F: std::future::Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    (name, tokio::spawn(fut))
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing apinet controller");

        let client = Client::try_default().await?;
        let cancel = CancellationToken::new();
        let csr_approver_enabled = config.csr_approver_enabled;
        let namespace = config.watch_namespace.clone();

        let reconciler = Arc::new(Reconciler::new(
            config,
            clients(&client),
            Arc::new(KubeEventPublisher::new(client.clone())),
            cancel.clone(),
        )?);
        let watcher = Watcher::new(reconciler, client, namespace);

        let mut watchers = Vec::new();
        macro_rules! start {
            ($name:literal, $method:ident) => {{
                let w = watcher.clone();
                watchers.push(spawn($name, async move { w.$method().await }));
            }};
        }
        start!("node-cache", stream_nodes);
        start!("instance-cache", stream_instances);
        start!("network", watch_networks);
        start!("network-id-gc", watch_network_ids);
        start!("ip", watch_ips);
        start!("ip-address-gc", watch_ip_addresses);
        start!("network-interface", watch_network_interfaces);
        start!("load-balancer", watch_load_balancers);
        start!("nat-gateway", watch_nat_gateways);
        start!("nat-gateway-autoscaler", watch_nat_gateway_autoscalers);
        start!("network-policy", watch_network_policies);
        start!("daemon-set", watch_daemon_sets);
        start!("scheduler", watch_scheduler);
        if csr_approver_enabled {
            start!("certificate-approval", watch_certificate_signing_requests);
        } else {
            info!("Certificate approval disabled");
        }

        Ok(Self { watchers, cancel })
    }

    /// Runs until a watcher exits or the process receives Ctrl-C.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(watchers = self.watchers.len(), "apinet controller running");
        let (names, handles): (Vec<_>, Vec<_>) = self.watchers.into_iter().unzip();

        let result = tokio::select! {
            (result, index, remaining) = select_all(handles) => {
                for handle in remaining {
                    handle.abort();
                }
                let name = names.get(index).copied().unwrap_or("unknown");
                match result {
                    Ok(Ok(())) => Err(ControllerError::Watch(format!("{name} watcher exited"))),
                    Ok(Err(e)) => Err(ControllerError::Watch(format!("{name} watcher error: {e}"))),
                    Err(e) => Err(ControllerError::Watch(format!("{name} watcher panicked: {e}"))),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        };
        self.cancel.cancel();
        if let Err(e) = &result {
            error!(error = %e, "apinet controller stopped");
        }
        result
    }
}
