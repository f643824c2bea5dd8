//! Reconciliation logic for the internal store.
//!
//! One `Reconciler` holds the store clients, allocators and in-process
//! state shared by every controller. Each controller lives in its own
//! module as an `impl Reconciler` block:
//! - `network`, `ip`, `network_interface`, `load_balancer`: allocation
//! - `nat_gateway`, `nat_gateway_autoscaler`: NAT port blocks
//! - `daemon_set`, `scheduler`: instance roll-out and placement
//! - `network_policy`: policy resolution
//! - `gc`: orphaned leaves and stale NAT claims
//! - `certificate`: CSR approval for the datapath agents

pub mod certificate;
pub mod daemon_set;
pub mod gc;
pub mod ip;
pub mod load_balancer;
pub mod nat_allocation;
pub mod nat_claim;
pub mod nat_gateway;
pub mod nat_gateway_autoscaler;
pub mod network;
pub mod network_interface;
pub mod network_policy;
pub mod scheduler;

#[cfg(test)]
mod load_balancer_test;
#[cfg(test)]
mod nat_gateway_test;

use apinet_allocator::{Allocators, IPAddressAllocator, IPAllocator, RetryConfig, VniAllocator};
use apinet_api::internal::{
    DaemonSet, IP, IPAddress, Instance, LoadBalancer, NATGateway, NATGatewayAutoscaler, NATTable, Network,
    NetworkID, NetworkInterface, NetworkPolicy, NetworkPolicyRule, Node,
};
use apinet_client::{ResourceClient, ResourceObject};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::runtime::events::EventType;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffStates;
use crate::config::Config;
use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::expectations::Expectations;
use certificate::CsrApproval;
use scheduler::SchedulerCache;

/// Number of claimer uids the GC controllers remember as gone.
pub const ABSENT_UID_CACHE_SIZE: usize = 500;

/// Store clients, one per kind the controllers touch.
#[derive(Clone)]
pub struct Clients {
    pub networks: Arc<dyn ResourceClient<Network>>,
    pub network_ids: Arc<dyn ResourceClient<NetworkID>>,
    pub ips: Arc<dyn ResourceClient<IP>>,
    pub ip_addresses: Arc<dyn ResourceClient<IPAddress>>,
    pub network_interfaces: Arc<dyn ResourceClient<NetworkInterface>>,
    pub load_balancers: Arc<dyn ResourceClient<LoadBalancer>>,
    pub nat_gateways: Arc<dyn ResourceClient<NATGateway>>,
    pub nat_tables: Arc<dyn ResourceClient<NATTable>>,
    pub nat_gateway_autoscalers: Arc<dyn ResourceClient<NATGatewayAutoscaler>>,
    pub network_policies: Arc<dyn ResourceClient<NetworkPolicy>>,
    pub network_policy_rules: Arc<dyn ResourceClient<NetworkPolicyRule>>,
    pub daemon_sets: Arc<dyn ResourceClient<DaemonSet>>,
    pub instances: Arc<dyn ResourceClient<Instance>>,
    pub nodes: Arc<dyn ResourceClient<Node>>,
    pub csr_approval: Arc<dyn CsrApproval>,
}

/// Reconciles the internal store.
pub struct Reconciler {
    pub(crate) config: Config,
    pub(crate) clients: Clients,
    pub(crate) vni_allocator: VniAllocator,
    pub(crate) allocators: Allocators,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) expectations: Expectations,
    pub(crate) scheduler_cache: SchedulerCache,
    /// Claimer uids known to be gone (uid -> ())
    absent_uids: Mutex<LruCache<String, ()>>,
    backoff_states: BackoffStates,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("vni_allocator", &self.vni_allocator)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        config: Config,
        clients: Clients,
        events: Arc<dyn EventPublisher>,
        cancel: CancellationToken,
    ) -> Result<Self, ControllerError> {
        let vni_allocator = VniAllocator::new(Arc::clone(&clients.network_ids), config.vni_range);
        let addresses = IPAddressAllocator::new(Arc::clone(&clients.ip_addresses), config.public_prefixes.clone())?;
        let ips = IPAllocator::new(Arc::clone(&clients.ips), RetryConfig::default(), cancel);
        let capacity = NonZeroUsize::new(ABSENT_UID_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            expectations: Expectations::new(config.expectation_timeout),
            config,
            clients,
            vni_allocator,
            allocators: Allocators::new(ips, addresses),
            events,
            scheduler_cache: SchedulerCache::default(),
            absent_uids: Mutex::new(LruCache::new(capacity)),
            backoff_states: BackoffStates::default(),
        })
    }

    /// Next requeue delay for a failing object.
    pub fn next_backoff(&self, key: &str) -> std::time::Duration {
        self.backoff_states.next_backoff(key)
    }

    /// Clears the failure history of an object after a successful pass.
    pub fn reset_backoff(&self, key: &str) {
        self.backoff_states.reset(key);
    }

    pub(crate) fn is_absent(&self, uid: &str) -> bool {
        self.absent_uids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(uid)
    }

    pub(crate) fn mark_absent(&self, uid: &str) {
        self.absent_uids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(uid.to_string(), ());
    }

    /// Publishes an event about `obj`.
    pub(crate) async fn publish<K: ResourceObject>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: impl Into<String>,
    ) {
        self.events
            .publish(&object_reference(obj), type_, reason, action, Some(note.into()))
            .await;
    }
}

/// `kind/namespace/name` of an object, used for backoff and log keys.
pub fn object_key<K: ResourceObject>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}/{}",
        K::kind(&()),
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// Name of a persisted object.
pub(crate) fn name_of<K: ResourceObject>(obj: &K) -> Result<&str, ControllerError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{} without a name", K::kind(&()))))
}

/// Uid of a persisted object.
pub(crate) fn uid_of<K: ResourceObject>(obj: &K) -> Result<&str, ControllerError> {
    obj.meta()
        .uid
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{} without a uid", K::kind(&()))))
}

pub(crate) fn is_deleting<K: ResourceObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Controller owner reference pointing at `obj`.
pub(crate) fn controller_reference<K: ResourceObject>(obj: &K) -> Result<OwnerReference, ControllerError> {
    Ok(OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: name_of(obj)?.to_string(),
        uid: uid_of(obj)?.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

pub(crate) fn object_reference<K: ResourceObject>(obj: &K) -> ObjectReference {
    let meta = obj.meta();
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        namespace: meta.namespace.clone(),
        name: meta.name.clone(),
        uid: meta.uid.clone(),
        resource_version: meta.resource_version.clone(),
        field_path: None,
    }
}
