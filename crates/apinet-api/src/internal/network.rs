//! Network CRD
//!
//! An overlay network identified by a VNI.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "Network",
    namespaced,
    status = "NetworkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Decimal-encoded VNI. Allocated by the controller when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Networks this network wants to peer with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<NetworkPeering>,
}

/// Requested peering with another network, addressed by VNI.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeering {
    /// Name of the peering (unique within the network)
    pub name: String,

    /// VNI of the peer network
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Progress of each requested peering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peerings: Vec<NetworkPeeringStatus>,

    /// VNIs this network is mutually peered with (sorted, no duplicates)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peered_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPeeringStatus {
    /// VNI of the peer network
    pub id: String,

    pub state: NetworkPeeringState,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum NetworkPeeringState {
    #[default]
    Pending,
    Ready,
}

impl Network {
    /// Allocated VNI, if any.
    pub fn vni(&self) -> Option<u32> {
        self.spec.id.as_deref().and_then(|id| crate::vni::parse_vni(id).ok())
    }
}
