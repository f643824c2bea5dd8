//! Load balancers: public IPs and the daemon set running their instances.

use apinet_api::LoadBalancerType;
use apinet_api::LocalUidReference;
use apinet_api::internal::{
    DaemonSet, DaemonSetSpec, InstanceSpec, InstanceTemplate, InstanceType, LoadBalancer,
};
use apinet_api::labels::{APINET_FIELD_OWNER, LOAD_BALANCER_NAME_LABEL};
use apinet_api::selector::LabelSelector;
use apinet_client::error::ignore_not_found;
use apinet_client::{ClientError, add_finalizer, has_finalizer, remove_finalizer};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{Reconciler, controller_reference, is_deleting, name_of, uid_of};
use crate::error::ControllerError;

/// Held while a load balancer owns public IPs or a daemon set.
pub const LOAD_BALANCER_FINALIZER: &str = "apinet.ironcore.dev/load-balancer";

/// Daemon set running the instances of `lb`, named after it.
pub(crate) fn load_balancer_daemon_set(lb: &LoadBalancer) -> Result<DaemonSet, ControllerError> {
    let name = name_of(lb)?;
    let name_labels = BTreeMap::from([(LOAD_BALANCER_NAME_LABEL.to_string(), name.to_string())]);
    let selector = lb
        .spec
        .selector
        .clone()
        .unwrap_or_else(|| LabelSelector::from_labels(name_labels.clone()));

    let mut metadata = lb.spec.template.metadata.clone();
    metadata.labels.extend(name_labels);

    let template = InstanceTemplate {
        metadata,
        spec: InstanceSpec {
            type_: InstanceType::LoadBalancer,
            load_balancer_type: Some(lb.spec.type_),
            network_ref: lb.spec.network_ref.clone(),
            ips: lb.spec.ips.iter().filter_map(|ip| ip.ip).collect(),
            load_balancer_ref: Some(LocalUidReference::new(name, uid_of(lb)?)),
            node_ref: None,
            ..lb.spec.template.spec.clone()
        },
    };

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: lb.metadata.namespace.clone(),
            owner_references: Some(vec![controller_reference(lb)?]),
            ..Default::default()
        },
        spec: DaemonSetSpec { selector, template },
        status: None,
    })
}

impl Reconciler {
    /// Allocates the public IPs of a load balancer and applies the daemon
    /// set implementing it. Internal load balancers use their addresses as
    /// given.
    pub async fn reconcile_load_balancer(&self, lb: &LoadBalancer) -> Result<Action, ControllerError> {
        let name = name_of(lb)?;
        let namespace = lb.metadata.namespace.as_deref();
        let client = self.clients.load_balancers.as_ref();

        if is_deleting(lb) {
            if has_finalizer(lb, LOAD_BALANCER_FINALIZER) {
                self.allocators.release(lb).await?;
                ignore_not_found(self.clients.daemon_sets.delete(namespace, name).await)?;
                remove_finalizer(client, lb, LOAD_BALANCER_FINALIZER).await?;
                info!(load_balancer = name, "Cleaned up load balancer");
            }
            return Ok(Action::await_change());
        }

        let mut lb = add_finalizer(client, lb, LOAD_BALANCER_FINALIZER).await?;
        if lb.spec.type_ == LoadBalancerType::Public {
            lb = self
                .sync_public_ips(client, &lb, |ips| json!({ "ips": ips }))
                .await?;
        }

        let daemon_set = load_balancer_daemon_set(&lb)?;
        let value = serde_json::to_value(&daemon_set).map_err(ClientError::from)?;
        self.clients
            .daemon_sets
            .apply(namespace, name, &value, APINET_FIELD_OWNER)
            .await?;
        debug!(load_balancer = name, ips = daemon_set.spec.template.spec.ips.len(), "Applied daemon set");
        Ok(Action::await_change())
    }
}
