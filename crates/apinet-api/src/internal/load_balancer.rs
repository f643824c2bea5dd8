//! LoadBalancer and LoadBalancerRouting CRDs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{LoadBalancerType, LocalObjectReference, Protocol};
use crate::internal::instance::InstanceTemplate;
use crate::internal::ip::PublicIPRequest;
use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "LoadBalancer",
    namespaced,
    status = "LoadBalancerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(rename = "type", default)]
    pub type_: LoadBalancerType,

    pub network_ref: LocalObjectReference,

    /// Public (or internal) addresses of the load balancer
    #[serde(default)]
    pub ips: Vec<PublicIPRequest>,

    /// Port filter; empty means all ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<LoadBalancerPort>,

    /// Selector over the instances implementing the load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Template of the instances implementing the load balancer
    pub template: InstanceTemplate,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

/// Routing table of a load balancer. Shares its owner's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "LoadBalancerRouting",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRoutingSpec {
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

/// Network interface traffic is routed to.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerTargetRef {
    pub uid: String,
    pub name: String,
    pub node_ref: LocalObjectReference,
}
