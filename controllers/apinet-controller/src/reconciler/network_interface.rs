//! Public IPs of network interfaces.

use apinet_api::internal::NetworkInterface;
use apinet_client::{add_finalizer, has_finalizer, remove_finalizer};
use kube::runtime::controller::Action;
use serde_json::json;
use tracing::{debug, info};

use super::{Reconciler, is_deleting, name_of};
use crate::error::ControllerError;

/// Held while a network interface owns public IPs.
pub const NETWORK_INTERFACE_FINALIZER: &str = "apinet.ironcore.dev/network-interface";

impl Reconciler {
    pub async fn reconcile_network_interface(&self, nic: &NetworkInterface) -> Result<Action, ControllerError> {
        let name = name_of(nic)?;
        let client = self.clients.network_interfaces.as_ref();

        if is_deleting(nic) {
            if has_finalizer(nic, NETWORK_INTERFACE_FINALIZER) {
                self.allocators.release(nic).await?;
                remove_finalizer(client, nic, NETWORK_INTERFACE_FINALIZER).await?;
                info!(network_interface = name, "Released public IPs");
            }
            return Ok(Action::await_change());
        }

        if nic.spec.public_ips.is_empty() && !has_finalizer(nic, NETWORK_INTERFACE_FINALIZER) {
            debug!(network_interface = name, "No public IPs requested");
            return Ok(Action::await_change());
        }

        let nic = add_finalizer(client, nic, NETWORK_INTERFACE_FINALIZER).await?;
        self.sync_public_ips(client, &nic, |ips| json!({ "publicIps": ips }))
            .await?;
        Ok(Action::await_change())
    }
}
