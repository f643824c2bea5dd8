//! Upstream NATGateway CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{IPFamily, LocalObjectReference};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "networking.ironcore.dev",
    version = "v1alpha1",
    kind = "NATGateway",
    namespaced,
    status = "NATGatewayStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewaySpec {
    #[serde(rename = "type", default)]
    pub type_: NATGatewayType,

    pub ip_family: IPFamily,

    pub network_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports_per_network_interface: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum NATGatewayType {
    #[default]
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NATGatewayStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,
}
