//! Upstream VirtualIP CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::IPFamily;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "networking.ironcore.dev",
    version = "v1alpha1",
    kind = "VirtualIP",
    namespaced,
    status = "VirtualIPStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIPSpec {
    #[serde(rename = "type", default)]
    pub type_: VirtualIPType,

    pub ip_family: IPFamily,

    /// Network interface the virtual IP is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<crate::common::LocalUidReference>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VirtualIPType {
    #[default]
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualIPStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}
