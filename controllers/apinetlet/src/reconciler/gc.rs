//! Collection of internal records whose upstream source is gone.
//!
//! Translated records carry the source triple as labels. A record whose
//! source no longer exists, or was recreated under a new uid, is deleted.
//! Network interfaces are not ours to delete; their claim is released
//! instead.
//!
//! Deleting an upstream record touches none of its translations, so the GC
//! watchers map upstream events onto them through [`translated_from`].

use apinet_api::SourceRef;
use apinet_api::internal as apinet;
use apinet_api::labels::SOURCE_UID_LABEL;
use apinet_client::error::ignore_not_found;
use apinet_client::{ClaimManager, ResourceClient, ResourceObject, SourceLabelStrategy};
use kube::Resource;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;

fn source_of<K: ResourceObject>(record: &K) -> Option<SourceRef> {
    record.meta().labels.as_ref().and_then(SourceRef::from_labels)
}

/// Internal records labelled with the uid of `source`.
pub fn translated_from<K, U>(records: Vec<Arc<K>>, source: &U) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    U: Resource,
{
    let Some(uid) = source.meta().uid.as_deref() else {
        return Vec::new();
    };
    records
        .into_iter()
        .filter(|record| {
            record
                .meta()
                .labels
                .as_ref()
                .and_then(|labels| labels.get(SOURCE_UID_LABEL))
                .is_some_and(|label| label == uid)
        })
        .map(|record| ObjectRef::from_obj(record.as_ref()))
        .collect()
}

impl Reconciler {
    /// Whether `source` still names a live record of `upstream`.
    async fn source_exists<U: ResourceObject>(
        &self,
        upstream: &dyn ResourceClient<U>,
        source: &SourceRef,
    ) -> Result<bool, ControllerError> {
        let found = upstream.get_opt(Some(&source.namespace), &source.name).await?;
        Ok(found.is_some_and(|obj| obj.meta().uid.as_deref() == Some(source.uid.as_str())))
    }

    /// Source of `record` once it is gone. Records of unwatched upstream
    /// namespaces are never orphaned.
    async fn orphaned_source<K: ResourceObject, U: ResourceObject>(
        &self,
        record: &K,
        upstream: &dyn ResourceClient<U>,
    ) -> Result<Option<SourceRef>, ControllerError> {
        if is_deleting(record) {
            return Ok(None);
        }
        let Some(source) = source_of(record) else {
            return Ok(None);
        };
        if !self.watches_namespace(&source.namespace) || self.source_exists(upstream, &source).await? {
            return Ok(None);
        }
        Ok(Some(source))
    }

    async fn collect_translated<K: ResourceObject, U: ResourceObject>(
        &self,
        client: &dyn ResourceClient<K>,
        record: &K,
        upstream: &dyn ResourceClient<U>,
    ) -> Result<Action, ControllerError> {
        let Some(source) = self.orphaned_source(record, upstream).await? else {
            return Ok(Action::await_change());
        };
        let name = name_of(record)?;
        ignore_not_found(client.delete(record.meta().namespace.as_deref(), name).await)?;
        info!(
            kind = %K::kind(&()),
            name,
            source_namespace = %source.namespace,
            source_name = %source.name,
            "Collected orphaned record"
        );
        Ok(Action::await_change())
    }

    pub async fn reconcile_network_gc(&self, network: &apinet::Network) -> Result<Action, ControllerError> {
        self.collect_translated(self.apinet.networks.as_ref(), network, self.upstream.networks.as_ref())
            .await
    }

    pub async fn reconcile_ip_gc(&self, ip: &apinet::IP) -> Result<Action, ControllerError> {
        self.collect_translated(self.apinet.ips.as_ref(), ip, self.upstream.virtual_ips.as_ref())
            .await
    }

    pub async fn reconcile_load_balancer_gc(&self, lb: &apinet::LoadBalancer) -> Result<Action, ControllerError> {
        self.collect_translated(self.apinet.load_balancers.as_ref(), lb, self.upstream.load_balancers.as_ref())
            .await
    }

    pub async fn reconcile_nat_gateway_gc(&self, gateway: &apinet::NATGateway) -> Result<Action, ControllerError> {
        self.collect_translated(self.apinet.nat_gateways.as_ref(), gateway, self.upstream.nat_gateways.as_ref())
            .await
    }

    pub async fn reconcile_network_policy_gc(
        &self,
        policy: &apinet::NetworkPolicy,
    ) -> Result<Action, ControllerError> {
        self.collect_translated(
            self.apinet.network_policies.as_ref(),
            policy,
            self.upstream.network_policies.as_ref(),
        )
        .await
    }

    /// Releases an internal interface claimed by a vanished upstream
    /// interface.
    pub async fn reconcile_network_interface_gc(
        &self,
        nic: &apinet::NetworkInterface,
    ) -> Result<Action, ControllerError> {
        let Some(source) = self
            .orphaned_source(nic, self.upstream.network_interfaces.as_ref())
            .await?
        else {
            return Ok(Action::await_change());
        };
        let strategy = SourceLabelStrategy::new(source.labels(), SOURCE_UID_LABEL);
        let manager = ClaimManager::new(self.apinet.network_interfaces.as_ref(), strategy, |_| false);
        manager.claim(vec![nic.clone()]).await?;
        debug!(
            network_interface = ?nic.metadata.name,
            source_name = %source.name,
            "Released orphaned network interface"
        );
        Ok(Action::await_change())
    }
}
