//! NATGateway, NATTable and NATGatewayAutoscaler CRDs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{IPFamily, LocalObjectReference};

/// First port handed out in NAT port blocks; lower ports are well-known.
pub const MIN_EPHEMERAL_PORT: i32 = 1024;

/// Last usable port.
pub const MAX_EPHEMERAL_PORT: i32 = 65535;

/// Ports per network interface when none is configured.
pub const DEFAULT_PORTS_PER_NETWORK_INTERFACE: i32 = 2048;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NATGateway",
    namespaced,
    status = "NATGatewayStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewaySpec {
    pub ip_family: IPFamily,

    pub network_ref: LocalObjectReference,

    /// Public IPs of the gateway, in declared order
    #[serde(default)]
    pub ips: Vec<NATGatewayIP>,

    /// Size of each port block, a power of two
    pub ports_per_network_interface: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayIP {
    pub name: String,

    /// Allocated address; empty until the public-prefix allocator assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayStatus {
    /// Number of port blocks in use
    #[serde(default)]
    pub used_nat_ips: i64,

    /// Number of eligible network interfaces
    #[serde(default)]
    pub requested_nat_ips: i64,
}

/// Number of port blocks a single IP provides for `ports_per_interface`.
pub fn slots_per_ip(ports_per_interface: i32) -> i64 {
    if ports_per_interface <= 0 {
        return 0;
    }
    i64::from(MAX_EPHEMERAL_PORT - MIN_EPHEMERAL_PORT + 1) / i64::from(ports_per_interface)
}

impl NATGateway {
    pub fn slots_per_ip(&self) -> i64 {
        slots_per_ip(self.spec.ports_per_network_interface)
    }

    /// Addresses of the gateway IPs that have been allocated, in order.
    pub fn allocated_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.spec.ips.iter().filter_map(|ip| ip.ip)
    }
}

/// Port-block table of a NAT gateway. Shares its owner's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NATTable",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NATTableSpec {
    #[serde(default)]
    pub ips: Vec<NATIP>,
}

/// Sections handed out on one gateway IP.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATIP {
    pub ip: IpAddr,

    #[serde(default)]
    pub sections: Vec<NATIPSection>,
}

/// Port block `[port, end_port]` assigned to a source address.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATIPSection {
    /// Source address of the interface
    pub ip: IpAddr,

    pub port: i32,

    pub end_port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<NATTableIPTargetRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NATTableIPTargetRef {
    pub uid: String,
    pub name: String,
    pub node_ref: LocalObjectReference,
}

/// Scales the public IPs of a NAT gateway with demand.
///
/// `min_public_ips` and `max_public_ips` bound the result even when no
/// interface requests NAT, so a gateway never shrinks below the minimum.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NATGatewayAutoscaler",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayAutoscalerSpec {
    pub nat_gateway_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_public_ips: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_public_ips: Option<i32>,
}
