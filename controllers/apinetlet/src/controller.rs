//! Main controller implementation.
//!
//! Connects to the upstream and internal stores, builds the shared
//! [`Reconciler`] and runs one watcher task per translated kind until one
//! of them exits or the process is interrupted.

use apinet_client::KubeClient;
use futures::future::select_all;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::{ApinetClients, Reconciler, UpstreamClients};
use crate::watcher::Watcher;

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Upstream-to-internal translator.
#[derive(Debug)]
pub struct Controller {
    watchers: Vec<(&'static str, WatcherHandle)>,
}

fn upstream_clients(client: &Client) -> UpstreamClients {
    UpstreamClients {
        networks: Arc::new(KubeClient::namespaced(client.clone())),
        network_interfaces: Arc::new(KubeClient::namespaced(client.clone())),
        virtual_ips: Arc::new(KubeClient::namespaced(client.clone())),
        load_balancers: Arc::new(KubeClient::namespaced(client.clone())),
        load_balancer_routings: Arc::new(KubeClient::namespaced(client.clone())),
        nat_gateways: Arc::new(KubeClient::namespaced(client.clone())),
        network_policies: Arc::new(KubeClient::namespaced(client.clone())),
        prefixes: Arc::new(KubeClient::namespaced(client.clone())),
    }
}

fn apinet_clients(client: &Client) -> ApinetClients {
    ApinetClients {
        networks: Arc::new(KubeClient::namespaced(client.clone())),
        ips: Arc::new(KubeClient::namespaced(client.clone())),
        network_interfaces: Arc::new(KubeClient::namespaced(client.clone())),
        load_balancers: Arc::new(KubeClient::namespaced(client.clone())),
        load_balancer_routings: Arc::new(KubeClient::namespaced(client.clone())),
        nat_gateways: Arc::new(KubeClient::namespaced(client.clone())),
        nat_gateway_autoscalers: Arc::new(KubeClient::namespaced(client.clone())),
        nat_tables: Arc::new(KubeClient::namespaced(client.clone())),
        network_policies: Arc::new(KubeClient::namespaced(client.clone())),
    }
}

/// Client of the internal store read from `path`.
async fn apinet_client(path: &Path) -> Result<Client, ControllerError> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| ControllerError::InvalidConfig(format!("reading {}: {e}", path.display())))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("loading {}: {e}", path.display())))?;
    Ok(Client::try_from(config)?)
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
        info!("Initializing apinetlet");

        let upstream = Client::try_default().await?;
        let apinet = match config.apinet_kubeconfig.as_deref() {
            Some(path) => apinet_client(path).await?,
            None => upstream.clone(),
        };
        let upstream_namespace = config.upstream_namespace.clone();
        let apinet_namespace = config.apinet_namespace.clone();

        let reconciler = Arc::new(Reconciler::new(
            config,
            upstream_clients(&upstream),
            apinet_clients(&apinet),
        ));
        let watcher = Watcher::new(reconciler, upstream, apinet, upstream_namespace, apinet_namespace);

        let mut watchers = Vec::new();
        macro_rules! start {
            ($name:literal, $method:ident) => {{
                let w = watcher.clone();
                watchers.push(spawn($name, async move { w.$method().await }));
            }};
        }
        start!("network", watch_networks);
        start!("network-interface", watch_network_interfaces);
        start!("virtual-ip", watch_virtual_ips);
        start!("load-balancer", watch_load_balancers);
        start!("nat-gateway", watch_nat_gateways);
        start!("network-policy", watch_network_policies);
        start!("network-gc", watch_network_gc);
        start!("ip-gc", watch_ip_gc);
        start!("network-interface-gc", watch_network_interface_gc);
        start!("load-balancer-gc", watch_load_balancer_gc);
        start!("nat-gateway-gc", watch_nat_gateway_gc);
        start!("network-policy-gc", watch_network_policy_gc);

        Ok(Self { watchers })
    }

    /// Runs until a watcher exits or the process receives Ctrl-C.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(watchers = self.watchers.len(), "apinetlet running");
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
        if let Err(e) = &result {
            error!(error = %e, "apinetlet stopped");
        }
        result
    }
}
