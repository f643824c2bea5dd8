//! IP reconciliation and the shared public-IP sync used by every
//! requester kind.

use apinet_allocator::ip::{address_claim_ref, is_ephemeral};
use apinet_allocator::{AllocationError, IPRequester};
use apinet_api::internal::{IP, PublicIPRequest};
use apinet_client::ResourceClient;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;
use crate::events::{actions, reasons};

impl Reconciler {
    /// Backs an IP record with an `IPAddress` leaf.
    ///
    /// Standalone IPs without an address get one from the public prefix.
    /// Ephemeral IPs are addressed by whoever created them.
    pub async fn reconcile_ip(&self, ip: &IP) -> Result<Action, ControllerError> {
        let name = name_of(ip)?;
        if is_deleting(ip) {
            return Ok(Action::await_change());
        }
        let Some(claim_ref) = address_claim_ref(ip) else {
            return Ok(Action::await_change());
        };

        if let Some(address) = ip.spec.ip {
            return match self.allocators.addresses().allocate(&claim_ref, address).await {
                Ok(_) => Ok(Action::await_change()),
                Err(e @ (AllocationError::AlreadyAllocated(_) | AllocationError::OutOfRange(_))) => {
                    warn!(ip = name, %address, error = %e, "IP address is not available");
                    self.publish(ip, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                        .await;
                    Ok(Action::await_change())
                }
                Err(e) => Err(e.into()),
            };
        }

        if is_ephemeral(ip) {
            debug!(ip = name, "Ephemeral IP not addressed yet");
            return Ok(Action::await_change());
        }

        let address = match self.allocators.addresses().allocate_next(&claim_ref, ip.spec.ip_family).await {
            Ok(address) => address,
            Err(e @ AllocationError::PoolExhausted(_)) => {
                self.publish(ip, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                    .await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = self.allocators.ips().set_address(ip, address).await {
            self.allocators
                .addresses()
                .release_claimed(&address, &claim_ref.uid)
                .await?;
            return Err(e.into());
        }
        info!(ip = name, %address, "Assigned address to IP");
        Ok(Action::await_change())
    }

    /// Converges the public IPs `obj` holds with the ones it requests.
    ///
    /// When the resolved requests differ from the stored ones they are
    /// written back through `spec_patch` under a resource-version
    /// precondition. The allocation is committed only once the write
    /// succeeded; otherwise everything it allocated is released again.
    pub(crate) async fn sync_public_ips<O: IPRequester>(
        &self,
        client: &dyn ResourceClient<O>,
        obj: &O,
        spec_patch: impl FnOnce(&[PublicIPRequest]) -> Value,
    ) -> Result<O, ControllerError> {
        let name = name_of(obj)?;
        let (resolved, tx) = match self.allocators.allocate_update(obj).await {
            Ok(result) => result,
            Err(e) => {
                if !e.is_conflict() {
                    self.publish(obj, EventType::Warning, reasons::ALLOCATION_FAILED, actions::ALLOCATE, e.to_string())
                        .await;
                }
                return Err(e.into());
            }
        };

        if resolved == obj.ip_requests() {
            tx.commit().await?;
            return Ok(obj.clone());
        }

        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "spec": spec_patch(&resolved),
        });
        match client.patch(obj.meta().namespace.as_deref(), name, &patch).await {
            Ok(updated) => {
                tx.commit().await?;
                info!(kind = %O::kind(&()), name, ips = resolved.len(), "Updated public IPs");
                Ok(updated)
            }
            Err(e) => {
                if let Err(revert_err) = tx.revert().await {
                    warn!(kind = %O::kind(&()), name, error = %revert_err, "Failed to revert IP allocation");
                }
                Err(e.into())
            }
        }
    }
}
