//! Kubernetes resource watchers.
//!
//! Every kind runs its own `kube_runtime::Controller` through the generic
//! [`watch_resource`] helper, which handles requeues, backoff and
//! reconnects. Cross-kind triggers are expressed as `owns` and `watches`
//! mappers over the controller's own reflector store.
//!
//! Nodes and instances are additionally streamed into the scheduler cache
//! and the daemon-set expectations by plain watch loops.

use apinet_api::internal::{
    DaemonSet, IP, IPAddress, Instance, LoadBalancer, NATGateway, NATGatewayAutoscaler, NATTable, Network,
    NetworkID, NetworkInterface, NetworkPolicy, NetworkPolicyRule, Node,
};
use apinet_client::ResourceObject;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use kube_runtime::{
    Controller, WatchStreamExt,
    controller::{Action, Config as ControllerConfig},
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::gc::{ip_addresses_claimed_by, network_ids_claimed_by, network_interfaces_claimed_by};
use crate::reconciler::{Reconciler, object_key};

/// Quiet period after the last event before an object is reconciled.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Parallel reconciles per controller.
pub const DEFAULT_CONCURRENCY: u16 = 3;

/// Requeue delay after an optimistic-concurrency conflict.
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Runs `controller` until its watch streams end.
///
/// Conflicts are retried after [`CONFLICT_REQUEUE`]; any other failure is
/// requeued along the object's Fibonacci backoff, which a successful
/// reconcile resets.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
    concurrency: u16,
) -> Result<(), ControllerError>
where
    K: ResourceObject,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!(kind = resource_name, concurrency, "Starting watcher");

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        if error.is_conflict() {
            debug!(kind = resource_name, name = %obj.name_any(), error = %error, "Conflict, requeueing");
            return Action::requeue(CONFLICT_REQUEUE);
        }
        let delay = ctx.next_backoff(&object_key(obj.as_ref()));
        error!(
            kind = resource_name,
            name = %obj.name_any(),
            namespace = ?obj.namespace(),
            error = %error,
            retry_in = ?delay,
            "Reconciliation failed"
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(obj.as_ref());
            debug!(kind = resource_name, object = %key, "Reconciling");
            let action = reconcile_fn(Arc::clone(&ctx), obj).await?;
            ctx.reset_backoff(&key);
            Ok(action)
        }
    };

    let controller_config = ControllerConfig::default()
        .debounce(DEBOUNCE)
        .concurrency(concurrency);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(kind = resource_name, error = %e, "Controller error");
            }
        })
        .await;

    Ok(())
}

/// Starts the controllers of the internal store.
#[derive(Clone)]
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, client: Client, namespace: Option<String>) -> Self {
        Self {
            reconciler,
            client,
            namespace,
        }
    }

    /// Api of a namespaced kind, limited to the watched namespace.
    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn cluster_api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub async fn watch_networks(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<Network>(), watcher::Config::default());
        let store = controller.store();
        // A peering's state depends on the peer's spec.
        let controller = controller.watches(self.api::<Network>(), watcher::Config::default(), move |changed: Network| {
            let id = changed.spec.id.clone();
            let peer_ids: Vec<String> = changed.spec.peerings.iter().map(|p| p.id.clone()).collect();
            store
                .state()
                .into_iter()
                .filter(|n| {
                    let lists_changed = id
                        .as_deref()
                        .is_some_and(|id| n.spec.peerings.iter().any(|p| p.id == id));
                    let listed_by_changed = n.spec.id.as_ref().is_some_and(|own| peer_ids.contains(own));
                    lists_changed || listed_by_changed
                })
                .map(|n| ObjectRef::from_obj(n.as_ref()))
                .collect::<Vec<_>>()
        });
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, network| Box::pin(async move { reconciler.reconcile_network(&network).await }),
            "Network",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Leaves are collected on their own events and whenever their
    /// claiming network changes or disappears.
    pub async fn watch_network_ids(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.cluster_api::<NetworkID>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(self.api::<Network>(), watcher::Config::default(), move |network: Network| {
            network_ids_claimed_by(store.state(), &network)
        });
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, id| Box::pin(async move { reconciler.reconcile_network_id_gc(&id).await }),
            "NetworkID",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    pub async fn watch_ips(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<IP>(), watcher::Config::default());
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, ip| Box::pin(async move { reconciler.reconcile_ip(&ip).await }),
            "IP",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    pub async fn watch_ip_addresses(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.cluster_api::<IPAddress>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(self.api::<IP>(), watcher::Config::default(), move |ip: IP| {
            ip_addresses_claimed_by(store.state(), &ip)
        });
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, address| Box::pin(async move { reconciler.reconcile_ip_address_gc(&address).await }),
            "IPAddress",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Public IPs and stale NAT claims of network interfaces. Gateway
    /// events reach the interfaces holding their claims.
    pub async fn watch_network_interfaces(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<NetworkInterface>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(
            self.api::<NATGateway>(),
            watcher::Config::default(),
            move |gateway: NATGateway| network_interfaces_claimed_by(store.state(), &gateway),
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, nic| {
                Box::pin(async move {
                    let action = reconciler.reconcile_network_interface(&nic).await?;
                    reconciler.reconcile_network_interface_nat_release(&nic).await?;
                    Ok(action)
                })
            },
            "NetworkInterface",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    pub async fn watch_load_balancers(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<LoadBalancer>(), watcher::Config::default())
            .owns(self.api::<DaemonSet>(), watcher::Config::default());
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, lb| Box::pin(async move { reconciler.reconcile_load_balancer(&lb).await }),
            "LoadBalancer",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// NAT gateways react to their table and to every interface change in
    /// their network.
    pub async fn watch_nat_gateways(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<NATGateway>(), watcher::Config::default())
            .owns(self.api::<NATTable>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(
            self.api::<NetworkInterface>(),
            watcher::Config::default(),
            move |nic: NetworkInterface| {
                store
                    .state()
                    .into_iter()
                    .filter(|gw| {
                        gw.namespace() == nic.namespace() && gw.spec.network_ref.name == nic.spec.network_ref.name
                    })
                    .map(|gw| ObjectRef::from_obj(gw.as_ref()))
                    .collect::<Vec<_>>()
            },
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, gateway| Box::pin(async move { reconciler.reconcile_nat_gateway(&gateway).await }),
            "NATGateway",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    pub async fn watch_nat_gateway_autoscalers(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<NATGatewayAutoscaler>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(
            self.api::<NATGateway>(),
            watcher::Config::default(),
            move |gateway: NATGateway| {
                let name = gateway.name_any();
                store
                    .state()
                    .into_iter()
                    .filter(|a| a.namespace() == gateway.namespace() && a.spec.nat_gateway_ref.name == name)
                    .map(|a| ObjectRef::from_obj(a.as_ref()))
                    .collect::<Vec<_>>()
            },
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, autoscaler| {
                Box::pin(async move { reconciler.reconcile_nat_gateway_autoscaler(&autoscaler).await })
            },
            "NATGatewayAutoscaler",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Policies re-resolve whenever an interface or load balancer of their
    /// namespace changes.
    pub async fn watch_network_policies(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<NetworkPolicy>(), watcher::Config::default())
            .owns(self.api::<NetworkPolicyRule>(), watcher::Config::default());
        let nic_store = controller.store();
        let lb_store = nic_store.clone();
        let controller = controller
            .watches(
                self.api::<NetworkInterface>(),
                watcher::Config::default(),
                move |nic: NetworkInterface| {
                    nic_store
                        .state()
                        .into_iter()
                        .filter(|p| p.namespace() == nic.namespace())
                        .map(|p| ObjectRef::from_obj(p.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .watches(
                self.api::<LoadBalancer>(),
                watcher::Config::default(),
                move |lb: LoadBalancer| {
                    lb_store
                        .state()
                        .into_iter()
                        .filter(|p| p.namespace() == lb.namespace())
                        .map(|p| ObjectRef::from_obj(p.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, policy| Box::pin(async move { reconciler.reconcile_network_policy(&policy).await }),
            "NetworkPolicy",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Daemon sets react to their instances and to any node change.
    pub async fn watch_daemon_sets(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<DaemonSet>(), watcher::Config::default())
            .owns(self.api::<Instance>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller.watches(self.cluster_api::<Node>(), watcher::Config::default(), move |_: Node| {
            store
                .state()
                .into_iter()
                .map(|ds| ObjectRef::from_obj(ds.as_ref()))
                .collect::<Vec<_>>()
        });
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, ds| Box::pin(async move { reconciler.reconcile_daemon_set(&ds).await }),
            "DaemonSet",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Binds instances one at a time so every decision sees the previous
    /// one in the scheduler cache.
    pub async fn watch_scheduler(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.api::<Instance>(), watcher::Config::default());
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, instance| Box::pin(async move { reconciler.reconcile_instance(&instance).await }),
            "Instance",
            1,
        )
        .await
    }

    pub async fn watch_certificate_signing_requests(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(
            self.cluster_api::<CertificateSigningRequest>(),
            watcher::Config::default(),
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, csr| Box::pin(async move { reconciler.reconcile_certificate_signing_request(&csr).await }),
            "CertificateSigningRequest",
            DEFAULT_CONCURRENCY,
        )
        .await
    }

    /// Feeds nodes into the scheduler cache.
    pub async fn stream_nodes(&self) -> Result<(), ControllerError> {
        info!("Starting node cache feed");
        let mut stream = watcher(self.cluster_api::<Node>(), watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(node) | Event::InitApply(node)) => self.reconciler.node_observed(node),
                Ok(Event::Delete(node)) => self.reconciler.node_deleted(&node),
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "Node watch failed"),
            }
        }
        Err(ControllerError::Watch("node watch stream ended".to_string()))
    }

    /// Feeds instances into the scheduler cache and the daemon-set
    /// expectations.
    pub async fn stream_instances(&self) -> Result<(), ControllerError> {
        info!("Starting instance cache feed");
        let mut stream = watcher(self.api::<Instance>(), watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(instance) | Event::InitApply(instance)) => self.reconciler.instance_observed(&instance),
                Ok(Event::Delete(instance)) => self.reconciler.instance_deleted(&instance),
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => warn!(error = %e, "Instance watch failed"),
            }
        }
        Err(ControllerError::Watch("instance watch stream ended".to_string()))
    }
}
