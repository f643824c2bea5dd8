//! Watchers over the upstream and internal stores.
//!
//! Every upstream kind runs its own `kube_runtime::Controller` through
//! [`watch_resource`]. Changes on the internal side are routed back to the
//! upstream record named by the source labels. Internal records are also
//! watched on their own to collect orphans, and upstream events reach the
//! records translated from them.

use apinet_api::SourceRef;
use apinet_api::internal as apinet;
use apinet_api::provider_id::parse_network_interface_id;
use apinet_api::upstream::load_balancer::{LoadBalancer, LoadBalancerRouting};
use apinet_api::upstream::nat_gateway::NATGateway;
use apinet_api::upstream::network::Network;
use apinet_api::upstream::network_interface::NetworkInterface;
use apinet_api::upstream::network_policy::NetworkPolicy;
use apinet_api::upstream::prefix::Prefix;
use apinet_api::upstream::virtual_ip::VirtualIP;
use apinet_client::ResourceObject;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::{
    Controller,
    controller::{Action, Config as ControllerConfig},
};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::gc::translated_from;
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
) -> Result<(), ControllerError>
where
    K: ResourceObject,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!(kind = resource_name, "Starting watcher");

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
        .concurrency(DEFAULT_CONCURRENCY);

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

/// Upstream record an internal record was translated from.
fn source_object<U, K>(record: &K) -> Option<ObjectRef<U>>
where
    U: Resource<DynamicType = ()>,
    K: Resource,
{
    let source = SourceRef::from_labels(record.meta().labels.as_ref()?)?;
    Some(ObjectRef::new(&source.name).within(&source.namespace))
}

/// Starts the translators.
#[derive(Clone)]
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    upstream: Client,
    apinet: Client,
    upstream_namespace: Option<String>,
    apinet_namespace: String,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("upstream_namespace", &self.upstream_namespace)
            .field("apinet_namespace", &self.apinet_namespace)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        upstream: Client,
        apinet: Client,
        upstream_namespace: Option<String>,
        apinet_namespace: String,
    ) -> Self {
        Self {
            reconciler,
            upstream,
            apinet,
            upstream_namespace,
            apinet_namespace,
        }
    }

    /// Api of an upstream kind, limited to the watched namespace.
    fn upstream_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match self.upstream_namespace.as_deref() {
            Some(ns) => Api::namespaced(self.upstream.clone(), ns),
            None => Api::all(self.upstream.clone()),
        }
    }

    fn apinet_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.apinet.clone(), &self.apinet_namespace)
    }

    /// Networks react to their internal network and to the networks they
    /// peer with.
    pub async fn watch_networks(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<Network>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(
                self.apinet_api::<apinet::Network>(),
                watcher::Config::default(),
                |internal: apinet::Network| source_object::<Network, _>(&internal),
            )
            .watches(
                self.upstream_api::<Network>(),
                watcher::Config::default(),
                move |changed: Network| {
                    let name = changed.name_any();
                    let namespace = changed.namespace();
                    store
                        .state()
                        .into_iter()
                        .filter(|n| {
                            n.spec.peerings.iter().any(|p| {
                                p.network_ref.name == name
                                    && p.network_ref.namespace.clone().or_else(|| n.namespace()) == namespace
                            })
                        })
                        .map(|n| ObjectRef::from_obj(n.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, network| Box::pin(async move { reconciler.reconcile_network(&network).await }),
            "Network",
        )
        .await
    }

    /// Network interfaces react to their internal interface and to every
    /// object their status or public IPs are derived from.
    pub async fn watch_network_interfaces(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<NetworkInterface>(), watcher::Config::default());
        let vip_store = controller.store();
        let prefix_store = vip_store.clone();
        let nat_store = vip_store.clone();
        let controller = controller
            .watches(
                self.apinet_api::<apinet::NetworkInterface>(),
                watcher::Config::default(),
                |internal: apinet::NetworkInterface| source_object::<NetworkInterface, _>(&internal),
            )
            .watches(
                self.upstream_api::<VirtualIP>(),
                watcher::Config::default(),
                move |vip: VirtualIP| {
                    let name = vip.name_any();
                    vip_store
                        .state()
                        .into_iter()
                        .filter(|nic| {
                            nic.namespace() == vip.namespace()
                                && nic
                                    .spec
                                    .virtual_ip
                                    .as_ref()
                                    .and_then(|v| v.virtual_ip_ref.as_ref())
                                    .is_some_and(|r| r.name == name)
                        })
                        .map(|nic| ObjectRef::from_obj(nic.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .watches(
                self.upstream_api::<Prefix>(),
                watcher::Config::default(),
                move |prefix: Prefix| {
                    let name = prefix.name_any();
                    prefix_store
                        .state()
                        .into_iter()
                        .filter(|nic| {
                            nic.namespace() == prefix.namespace()
                                && nic
                                    .spec
                                    .prefixes
                                    .iter()
                                    .any(|p| p.prefix_ref.as_ref().is_some_and(|r| r.name == name))
                        })
                        .map(|nic| ObjectRef::from_obj(nic.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .watches(
                self.apinet_api::<apinet::NATTable>(),
                watcher::Config::default(),
                move |table: apinet::NATTable| {
                    let targets: HashSet<String> = table
                        .spec
                        .ips
                        .iter()
                        .flat_map(|ip| ip.sections.iter())
                        .filter_map(|s| s.target_ref.as_ref().map(|t| t.uid.clone()))
                        .collect();
                    nat_store
                        .state()
                        .into_iter()
                        .filter(|nic| {
                            nic.spec
                                .provider_id
                                .as_deref()
                                .and_then(|id| parse_network_interface_id(id).ok())
                                .is_some_and(|id| targets.contains(&id.uid))
                        })
                        .map(|nic| ObjectRef::from_obj(nic.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, nic| Box::pin(async move { reconciler.reconcile_network_interface(&nic).await }),
            "NetworkInterface",
        )
        .await
    }

    pub async fn watch_virtual_ips(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<VirtualIP>(), watcher::Config::default()).watches(
            self.apinet_api::<apinet::IP>(),
            watcher::Config::default(),
            |ip: apinet::IP| source_object::<VirtualIP, _>(&ip),
        );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, vip| Box::pin(async move { reconciler.reconcile_virtual_ip(&vip).await }),
            "VirtualIP",
        )
        .await
    }

    /// Load balancers react to their internal load balancer, their
    /// routing table and their network.
    pub async fn watch_load_balancers(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<LoadBalancer>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(
                self.apinet_api::<apinet::LoadBalancer>(),
                watcher::Config::default(),
                |internal: apinet::LoadBalancer| source_object::<LoadBalancer, _>(&internal),
            )
            .watches(
                self.upstream_api::<LoadBalancerRouting>(),
                watcher::Config::default(),
                |routing: LoadBalancerRouting| {
                    let name = routing.name_any();
                    routing.namespace().map(|ns| ObjectRef::new(&name).within(&ns))
                },
            )
            .watches(
                self.upstream_api::<Network>(),
                watcher::Config::default(),
                move |network: Network| {
                    let name = network.name_any();
                    store
                        .state()
                        .into_iter()
                        .filter(|lb| lb.namespace() == network.namespace() && lb.spec.network_ref.name == name)
                        .map(|lb| ObjectRef::from_obj(lb.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, lb| Box::pin(async move { reconciler.reconcile_load_balancer(&lb).await }),
            "LoadBalancer",
        )
        .await
    }

    pub async fn watch_nat_gateways(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<NATGateway>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(
                self.apinet_api::<apinet::NATGateway>(),
                watcher::Config::default(),
                |internal: apinet::NATGateway| source_object::<NATGateway, _>(&internal),
            )
            .watches(
                self.upstream_api::<Network>(),
                watcher::Config::default(),
                move |network: Network| {
                    let name = network.name_any();
                    store
                        .state()
                        .into_iter()
                        .filter(|gw| gw.namespace() == network.namespace() && gw.spec.network_ref.name == name)
                        .map(|gw| ObjectRef::from_obj(gw.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, gateway| Box::pin(async move { reconciler.reconcile_nat_gateway(&gateway).await }),
            "NATGateway",
        )
        .await
    }

    pub async fn watch_network_policies(&self) -> Result<(), ControllerError> {
        let controller = Controller::new(self.upstream_api::<NetworkPolicy>(), watcher::Config::default());
        let store = controller.store();
        let controller = controller
            .watches(
                self.apinet_api::<apinet::NetworkPolicy>(),
                watcher::Config::default(),
                |internal: apinet::NetworkPolicy| source_object::<NetworkPolicy, _>(&internal),
            )
            .watches(
                self.upstream_api::<Network>(),
                watcher::Config::default(),
                move |network: Network| {
                    let name = network.name_any();
                    store
                        .state()
                        .into_iter()
                        .filter(|p| p.namespace() == network.namespace() && p.spec.network_ref.name == name)
                        .map(|p| ObjectRef::from_obj(p.as_ref()))
                        .collect::<Vec<_>>()
                },
            );
        watch_resource(
            controller,
            Arc::clone(&self.reconciler),
            |reconciler, policy| Box::pin(async move { reconciler.reconcile_network_policy(&policy).await }),
            "NetworkPolicy",
        )
        .await
    }

    /// GC controller of the internal kind `K`, also woken by events of
    /// the upstream kind `U` its records are translated from.
    fn gc_controller<K, U>(&self) -> Controller<K>
    where
        K: ResourceObject + Resource<Scope = NamespaceResourceScope>,
        U: ResourceObject + Resource<Scope = NamespaceResourceScope>,
    {
        let controller = Controller::new(self.apinet_api::<K>(), watcher::Config::default());
        let store = controller.store();
        controller.watches(self.upstream_api::<U>(), watcher::Config::default(), move |source: U| {
            translated_from(store.state(), &source)
        })
    }

    pub async fn watch_network_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::Network, Network>(),
            Arc::clone(&self.reconciler),
            |reconciler, network| Box::pin(async move { reconciler.reconcile_network_gc(&network).await }),
            "apinet Network",
        )
        .await
    }

    pub async fn watch_ip_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::IP, VirtualIP>(),
            Arc::clone(&self.reconciler),
            |reconciler, ip| Box::pin(async move { reconciler.reconcile_ip_gc(&ip).await }),
            "apinet IP",
        )
        .await
    }

    pub async fn watch_network_interface_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::NetworkInterface, NetworkInterface>(),
            Arc::clone(&self.reconciler),
            |reconciler, nic| Box::pin(async move { reconciler.reconcile_network_interface_gc(&nic).await }),
            "apinet NetworkInterface",
        )
        .await
    }

    pub async fn watch_load_balancer_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::LoadBalancer, LoadBalancer>(),
            Arc::clone(&self.reconciler),
            |reconciler, lb| Box::pin(async move { reconciler.reconcile_load_balancer_gc(&lb).await }),
            "apinet LoadBalancer",
        )
        .await
    }

    pub async fn watch_nat_gateway_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::NATGateway, NATGateway>(),
            Arc::clone(&self.reconciler),
            |reconciler, gateway| Box::pin(async move { reconciler.reconcile_nat_gateway_gc(&gateway).await }),
            "apinet NATGateway",
        )
        .await
    }

    pub async fn watch_network_policy_gc(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.gc_controller::<apinet::NetworkPolicy, NetworkPolicy>(),
            Arc::clone(&self.reconciler),
            |reconciler, policy| Box::pin(async move { reconciler.reconcile_network_policy_gc(&policy).await }),
            "apinet NetworkPolicy",
        )
        .await
    }
}
