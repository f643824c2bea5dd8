//! Translation from the upstream store into the internal store.
//!
//! Every upstream record is projected onto an internal record of the same
//! kind, named after the upstream uid and labelled with the upstream
//! source triple. The internal record's progress is projected back onto
//! the upstream status.
//!
//! - `network`: networks, peerings and provider IDs
//! - `network_interface`: public IPs, prefixes and status of interfaces
//!   realised by a machine provider
//! - `virtual_ip`: standalone public IPs
//! - `load_balancer`: load balancers and their routing tables
//! - `nat_gateway`: NAT gateways and their autoscalers
//! - `network_policy`: network policies
//! - `gc`: internal records whose upstream source is gone

pub mod gc;
pub mod load_balancer;
pub mod nat_gateway;
pub mod network;
pub mod network_interface;
pub mod network_policy;
pub mod virtual_ip;

#[cfg(test)]
mod network_interface_test;
#[cfg(test)]
mod network_policy_test;
#[cfg(test)]
mod network_test;

use apinet_api::SourceRef;
use apinet_api::internal as apinet;
use apinet_api::provider_id::{NetworkId, parse_network_id};
use apinet_api::upstream::load_balancer::{LoadBalancer, LoadBalancerRouting};
use apinet_api::upstream::nat_gateway::NATGateway;
use apinet_api::upstream::network::Network;
use apinet_api::upstream::network_interface::NetworkInterface;
use apinet_api::upstream::network_policy::NetworkPolicy;
use apinet_api::upstream::prefix::Prefix;
use apinet_api::upstream::virtual_ip::VirtualIP;
use apinet_client::{ClientError, ResourceClient, ResourceObject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffStates;
use crate::config::Config;
use crate::error::ControllerError;

/// Requeue delay while an internal record is still being torn down.
pub const DELETION_REQUEUE: Duration = Duration::from_secs(2);

/// Upstream store clients.
#[derive(Clone)]
pub struct UpstreamClients {
    pub networks: Arc<dyn ResourceClient<Network>>,
    pub network_interfaces: Arc<dyn ResourceClient<NetworkInterface>>,
    pub virtual_ips: Arc<dyn ResourceClient<VirtualIP>>,
    pub load_balancers: Arc<dyn ResourceClient<LoadBalancer>>,
    pub load_balancer_routings: Arc<dyn ResourceClient<LoadBalancerRouting>>,
    pub nat_gateways: Arc<dyn ResourceClient<NATGateway>>,
    pub network_policies: Arc<dyn ResourceClient<NetworkPolicy>>,
    pub prefixes: Arc<dyn ResourceClient<Prefix>>,
}

/// Internal store clients.
#[derive(Clone)]
pub struct ApinetClients {
    pub networks: Arc<dyn ResourceClient<apinet::Network>>,
    pub ips: Arc<dyn ResourceClient<apinet::IP>>,
    pub network_interfaces: Arc<dyn ResourceClient<apinet::NetworkInterface>>,
    pub load_balancers: Arc<dyn ResourceClient<apinet::LoadBalancer>>,
    pub load_balancer_routings: Arc<dyn ResourceClient<apinet::LoadBalancerRouting>>,
    pub nat_gateways: Arc<dyn ResourceClient<apinet::NATGateway>>,
    pub nat_gateway_autoscalers: Arc<dyn ResourceClient<apinet::NATGatewayAutoscaler>>,
    pub nat_tables: Arc<dyn ResourceClient<apinet::NATTable>>,
    pub network_policies: Arc<dyn ResourceClient<apinet::NetworkPolicy>>,
}

/// Translates upstream records.
pub struct Reconciler {
    pub(crate) config: Config,
    pub(crate) upstream: UpstreamClients,
    pub(crate) apinet: ApinetClients,
    backoff_states: BackoffStates,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(config: Config, upstream: UpstreamClients, apinet: ApinetClients) -> Self {
        Self {
            config,
            upstream,
            apinet,
            backoff_states: BackoffStates::default(),
        }
    }

    pub fn next_backoff(&self, key: &str) -> Duration {
        self.backoff_states.next_backoff(key)
    }

    pub fn reset_backoff(&self, key: &str) {
        self.backoff_states.reset(key);
    }

    pub(crate) fn apinet_namespace(&self) -> Option<&str> {
        Some(self.config.apinet_namespace.as_str())
    }

    /// Whether `namespace` is within the watched upstream namespace.
    pub(crate) fn watches_namespace(&self, namespace: &str) -> bool {
        self.config
            .upstream_namespace
            .as_deref()
            .is_none_or(|ns| ns == namespace)
    }

    /// Metadata of the internal record translated from `source`.
    pub(crate) fn translated_meta<K: ResourceObject>(&self, source: &K) -> Result<ObjectMeta, ControllerError> {
        Ok(ObjectMeta {
            name: Some(uid_of(source)?.to_string()),
            namespace: Some(self.config.apinet_namespace.clone()),
            labels: Some(source_ref(source)?.labels()),
            ..Default::default()
        })
    }

    /// Internal network backing the upstream network `name`, once the
    /// upstream network carries a provider ID.
    pub(crate) async fn resolve_network(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<NetworkId>, ControllerError> {
        let Some(network) = self.upstream.networks.get_opt(namespace, name).await? else {
            return Ok(None);
        };
        match network.spec.provider_id.as_deref() {
            Some(id) => Ok(Some(parse_network_id(id)?)),
            None => Ok(None),
        }
    }

    /// Deletes the internal record `name` of `client` and reports whether
    /// it is gone.
    pub(crate) async fn delete_translated<K: ResourceObject>(
        &self,
        client: &dyn ResourceClient<K>,
        name: &str,
    ) -> Result<bool, ControllerError> {
        match client.delete(self.apinet_namespace(), name).await {
            Ok(()) | Err(ClientError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(client.get_opt(self.apinet_namespace(), name).await?.is_none())
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

pub(crate) fn name_of<K: ResourceObject>(obj: &K) -> Result<&str, ControllerError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{} without a name", K::kind(&()))))
}

pub(crate) fn uid_of<K: ResourceObject>(obj: &K) -> Result<&str, ControllerError> {
    obj.meta()
        .uid
        .as_deref()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{} without a uid", K::kind(&()))))
}

pub(crate) fn is_deleting<K: ResourceObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Source triple of an upstream record.
pub(crate) fn source_ref<K: ResourceObject>(obj: &K) -> Result<SourceRef, ControllerError> {
    Ok(SourceRef::new(
        obj.meta().namespace.clone().unwrap_or_default(),
        name_of(obj)?,
        uid_of(obj)?,
    ))
}

/// Controller owner reference pointing at an internal record.
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

/// Serialises `obj` for server-side apply.
pub(crate) fn to_apply<K: ResourceObject>(obj: &K) -> Result<serde_json::Value, ControllerError> {
    Ok(serde_json::to_value(obj).map_err(ClientError::from)?)
}

/// Merge patch replacing `status` with `desired`, nulling fields that
/// `desired` leaves out.
pub(crate) fn status_patch<S: serde::Serialize>(
    current: Option<&S>,
    desired: &S,
) -> Result<serde_json::Value, ControllerError> {
    let mut status = serde_json::to_value(desired).map_err(ClientError::from)?;
    let current = current.map(serde_json::to_value).transpose().map_err(ClientError::from)?;
    if let (Some(serde_json::Value::Object(current)), serde_json::Value::Object(status)) = (current, &mut status) {
        for key in current.keys() {
            status.entry(key.clone()).or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": status }))
}

/// Writes `desired` as the status of `obj` unless it already is.
pub(crate) async fn update_status<K, S>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    current: Option<&S>,
    desired: S,
) -> Result<(), ControllerError>
where
    K: ResourceObject,
    S: serde::Serialize + PartialEq + Default,
{
    let unchanged = match current {
        Some(current) => *current == desired,
        None => desired == S::default(),
    };
    if unchanged {
        return Ok(());
    }
    let patch = status_patch(current, &desired)?;
    client
        .patch_status(obj.meta().namespace.as_deref(), name_of(obj)?, &patch)
        .await?;
    Ok(())
}
