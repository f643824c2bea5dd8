//! Network policies, translated as declared.
//!
//! Only the network reference changes; selectors are resolved in the
//! internal store.

use apinet_api::internal as apinet;
use apinet_api::labels::APINETLET_FIELD_OWNER;
use apinet_api::upstream::network_policy::NetworkPolicy;
use apinet_api::LocalObjectReference;
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::runtime::controller::Action;
use tracing::{debug, info};

use super::{DELETION_REQUEUE, Reconciler, is_deleting, name_of, to_apply, uid_of};
use crate::error::ControllerError;

/// Held until the internal network policy is gone.
pub const NETWORK_POLICY_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/networkpolicy";

impl Reconciler {
    pub async fn reconcile_network_policy(&self, policy: &NetworkPolicy) -> Result<Action, ControllerError> {
        let name = name_of(policy)?;
        let namespace = policy.metadata.namespace.as_deref();
        let client = self.upstream.network_policies.as_ref();
        let apinet_name = uid_of(policy)?.to_string();

        if is_deleting(policy) {
            if !has_finalizer(policy, NETWORK_POLICY_FINALIZER) {
                return Ok(Action::await_change());
            }
            if !self
                .delete_translated(self.apinet.network_policies.as_ref(), &apinet_name)
                .await?
            {
                debug!(network_policy = name, "Waiting for internal network policy to be deleted");
                return Ok(Action::requeue(DELETION_REQUEUE));
            }
            remove_finalizer(client, policy, NETWORK_POLICY_FINALIZER).await?;
            info!(network_policy = name, "Released network policy");
            return Ok(Action::await_change());
        }

        let Some(network) = self.resolve_network(namespace, &policy.spec.network_ref.name).await? else {
            debug!(network_policy = name, network = %policy.spec.network_ref.name, "Network not ready");
            return Ok(Action::await_change());
        };
        let policy = add_finalizer(client, policy, NETWORK_POLICY_FINALIZER).await?;

        let desired = apinet::NetworkPolicy {
            metadata: self.translated_meta(&policy)?,
            spec: apinet::NetworkPolicySpec {
                network_ref: LocalObjectReference::new(&network.name),
                network_interface_selector: policy.spec.network_interface_selector.clone(),
                priority: policy.spec.priority,
                policy_types: policy.spec.policy_types.clone(),
                ingress: policy.spec.ingress.clone(),
                egress: policy.spec.egress.clone(),
            },
        };
        self.apinet
            .network_policies
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&desired)?, APINETLET_FIELD_OWNER)
            .await?;
        Ok(Action::await_change())
    }
}
