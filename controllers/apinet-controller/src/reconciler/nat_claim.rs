//! NAT slot claims on network interfaces.
//!
//! Each network interface has one NAT slot per IP family. A gateway claims
//! the slot by writing its name and uid into `spec.nats`; only one gateway
//! can hold a slot at a time.

use apinet_api::IPFamily;
use apinet_api::LocalUidReference;
use apinet_api::internal::{NetworkInterface, NetworkInterfaceNAT};
use apinet_client::{ClaimState, ClaimStrategy, ClientError, ResourceClient};
use serde_json::json;

/// Claims the `family` NAT slot for one gateway.
#[derive(Debug, Clone)]
pub struct NATClaimStrategy {
    family: IPFamily,
    gateway: LocalUidReference,
}

impl NATClaimStrategy {
    pub fn new(family: IPFamily, gateway: LocalUidReference) -> Self {
        Self { family, gateway }
    }

    async fn write_nats(
        client: &dyn ResourceClient<NetworkInterface>,
        nic: &NetworkInterface,
        nats: Vec<NetworkInterfaceNAT>,
    ) -> Result<NetworkInterface, ClientError> {
        let name = nic
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClientError::Invalid("NetworkInterface without a name".to_string()))?;
        let patch = json!({
            "metadata": { "resourceVersion": nic.metadata.resource_version },
            "spec": { "nats": nats },
        });
        client.patch(nic.metadata.namespace.as_deref(), name, &patch).await
    }
}

#[async_trait::async_trait]
impl ClaimStrategy<NetworkInterface> for NATClaimStrategy {
    fn claim_state(&self, nic: &NetworkInterface) -> ClaimState {
        match nic.nat(self.family) {
            None => ClaimState::Unclaimed,
            Some(nat) if nat.claim_ref.uid == self.gateway.uid => ClaimState::Ours,
            Some(_) => ClaimState::Theirs,
        }
    }

    async fn adopt(
        &self,
        client: &dyn ResourceClient<NetworkInterface>,
        nic: &NetworkInterface,
    ) -> Result<NetworkInterface, ClientError> {
        let mut nats: Vec<_> = nic
            .spec
            .nats
            .iter()
            .filter(|n| n.ip_family != self.family)
            .cloned()
            .collect();
        nats.push(NetworkInterfaceNAT {
            ip_family: self.family,
            claim_ref: self.gateway.clone(),
        });
        nats.sort_by_key(|n| n.ip_family);
        Self::write_nats(client, nic, nats).await
    }

    async fn release(
        &self,
        client: &dyn ResourceClient<NetworkInterface>,
        nic: &NetworkInterface,
    ) -> Result<NetworkInterface, ClientError> {
        let nats = nic
            .spec
            .nats
            .iter()
            .filter(|n| !(n.ip_family == self.family && n.claim_ref.uid == self.gateway.uid))
            .cloned()
            .collect();
        Self::write_nats(client, nic, nats).await
    }
}
