//! Virtual IPs: standalone internal IPs.
//!
//! The internal IP is named after the virtual IP's uid so that network
//! interfaces can reference it without a lookup.

use apinet_api::internal as apinet;
use apinet_api::labels::APINETLET_FIELD_OWNER;
use apinet_api::upstream::virtual_ip::{VirtualIP, VirtualIPStatus};
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::runtime::controller::Action;
use tracing::{debug, info};

use super::{DELETION_REQUEUE, Reconciler, is_deleting, name_of, to_apply, uid_of, update_status};
use crate::error::ControllerError;

/// Held until the internal IP is gone.
pub const VIRTUAL_IP_FINALIZER: &str = "apinetlet.apinet.ironcore.dev/virtualip";

impl Reconciler {
    pub async fn reconcile_virtual_ip(&self, vip: &VirtualIP) -> Result<Action, ControllerError> {
        let name = name_of(vip)?;
        let client = self.upstream.virtual_ips.as_ref();
        let apinet_name = uid_of(vip)?.to_string();

        if is_deleting(vip) {
            if !has_finalizer(vip, VIRTUAL_IP_FINALIZER) {
                return Ok(Action::await_change());
            }
            if !self.delete_translated(self.apinet.ips.as_ref(), &apinet_name).await? {
                debug!(virtual_ip = name, "Waiting for internal IP to be deleted");
                return Ok(Action::requeue(DELETION_REQUEUE));
            }
            remove_finalizer(client, vip, VIRTUAL_IP_FINALIZER).await?;
            info!(virtual_ip = name, "Released virtual IP");
            return Ok(Action::await_change());
        }

        let vip = add_finalizer(client, vip, VIRTUAL_IP_FINALIZER).await?;

        let existing = self.apinet.ips.get_opt(self.apinet_namespace(), &apinet_name).await?;
        let (ip, claim_ref) = existing.map(|e| (e.spec.ip, e.spec.claim_ref)).unwrap_or_default();
        let desired = apinet::IP {
            metadata: self.translated_meta(&vip)?,
            spec: apinet::IPSpec {
                type_: apinet::IPType::Public,
                ip_family: vip.spec.ip_family,
                // Address and claim are written in the internal store.
                ip,
                claim_ref,
            },
        };
        let internal = self
            .apinet
            .ips
            .apply(self.apinet_namespace(), &apinet_name, &to_apply(&desired)?, APINETLET_FIELD_OWNER)
            .await?;

        let status = VirtualIPStatus { ip: internal.spec.ip };
        update_status(client, &vip, vip.status.as_ref(), status).await?;
        Ok(Action::await_change())
    }
}
