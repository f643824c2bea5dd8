//! Upstream Prefix CRD (`ipam.ironcore.dev`)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::IPFamily;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "ipam.ironcore.dev",
    version = "v1alpha1",
    kind = "Prefix",
    namespaced,
    status = "PrefixStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSpec {
    pub ip_family: IPFamily,

    /// Requested or allocated prefix in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrefixStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PrefixPhase>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum PrefixPhase {
    #[default]
    Pending,
    Allocated,
}

impl Prefix {
    /// The prefix once it has been allocated.
    pub fn allocated_prefix(&self) -> Option<&str> {
        let allocated = self
            .status
            .as_ref()
            .is_some_and(|s| s.phase == Some(PrefixPhase::Allocated));
        if allocated { self.spec.prefix.as_deref() } else { None }
    }
}
