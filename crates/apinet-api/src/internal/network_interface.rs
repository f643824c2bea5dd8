//! NetworkInterface CRD
//!
//! A NIC on a datapath node. `nats` holds one single-writer slot per IP
//! family, owned by the NAT gateway whose uid is recorded in it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{IPFamily, LocalObjectReference, LocalUidReference};
use crate::internal::ip::PublicIPRequest;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NetworkInterface",
    namespaced,
    status = "NetworkInterfaceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    pub network_ref: LocalObjectReference,

    /// Node hosting the interface
    pub node_ref: LocalObjectReference,

    /// Internal addresses
    #[serde(default)]
    pub ips: Vec<IpAddr>,

    /// Routed prefixes (CIDR notation)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_ips: Vec<PublicIPRequest>,

    /// NAT claims, at most one per IP family
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nats: Vec<NetworkInterfaceNAT>,
}

/// NAT slot of a network interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceNAT {
    pub ip_family: IPFamily,

    /// NAT gateway holding the slot
    pub claim_ref: LocalUidReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NetworkInterfaceState>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum NetworkInterfaceState {
    #[default]
    Pending,
    Ready,
    Error,
}

impl NetworkInterface {
    /// NAT slot for `family`, if claimed.
    pub fn nat(&self, family: IPFamily) -> Option<&NetworkInterfaceNAT> {
        self.spec.nats.iter().find(|n| n.ip_family == family)
    }

    /// Whether the interface has an internal address of `family`.
    pub fn has_ip_of_family(&self, family: IPFamily) -> bool {
        self.spec.ips.iter().any(|ip| family.contains(ip))
    }

    /// Whether the interface requests a public IP of `family`.
    pub fn has_public_ip_of_family(&self, family: IPFamily) -> bool {
        self.spec.public_ips.iter().any(|ip| ip.ip_family == family)
    }
}
