//! Upstream LoadBalancer and LoadBalancerRouting CRDs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{IPFamily, LoadBalancerType, LocalObjectReference, Protocol};
use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "networking.ironcore.dev",
    version = "v1alpha1",
    kind = "LoadBalancer",
    namespaced,
    status = "LoadBalancerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(rename = "type", default)]
    pub type_: LoadBalancerType,

    /// Families to allocate public addresses for
    #[serde(default)]
    pub ip_families: Vec<IPFamily>,

    /// Fixed addresses of an internal load balancer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,

    pub network_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<LoadBalancerPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpAddr>,
}

/// Interfaces a load balancer currently routes to. Shares the load
/// balancer's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "networking.ironcore.dev",
    version = "v1alpha1",
    kind = "LoadBalancerRouting",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRoutingSpec {
    pub network_ref: LocalObjectReference,

    #[serde(default)]
    pub destinations: Vec<LoadBalancerDestination>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDestination {
    pub ip: IpAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<LoadBalancerTargetRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerTargetRef {
    pub uid: String,
    pub name: String,
    pub provider_id: String,
}
