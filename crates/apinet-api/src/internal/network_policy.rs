//! NetworkPolicy and NetworkPolicyRule CRDs
//!
//! A policy declares selectors; its rule object carries the resolved
//! targets and peer addresses the datapath enforces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::{
    IPBlock, IPFamily, LocalObjectReference, NetworkPolicyEgressRule, NetworkPolicyIngressRule, PolicyType,
    PortRange,
};
use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub network_ref: LocalObjectReference,

    /// Interfaces the policy applies to
    #[serde(default)]
    pub network_interface_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default)]
    pub policy_types: Vec<PolicyType>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<NetworkPolicyIngressRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<NetworkPolicyEgressRule>,
}

/// Resolved form of a NetworkPolicy. Shares its owner's name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NetworkPolicyRule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyRuleSpec {
    pub network_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default)]
    pub targets: Vec<TargetNetworkInterface>,

    #[serde(default)]
    pub ingress_rules: Vec<Rule>,

    #[serde(default)]
    pub egress_rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct TargetNetworkInterface {
    pub uid: String,
    pub name: String,
    pub ip: IpAddr,
}

/// One resolved ingress or egress rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cidr_blocks: Vec<IPBlock>,

    /// Addresses of the objects matched by the rule's object selectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_ips: Vec<ObjectIP>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_policy_ports: Vec<PortRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIP {
    pub ip_family: IPFamily,

    /// Host prefix of the address (`/32` or `/128`)
    pub prefix: String,
}

impl ObjectIP {
    /// Host prefix of a single address.
    pub fn for_ip(ip: IpAddr) -> Self {
        Self {
            ip_family: IPFamily::of(&ip),
            prefix: ipnet::IpNet::from(ip).to_string(),
        }
    }
}
