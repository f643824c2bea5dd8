//! Instance CRD
//!
//! A load-balancer worker placed on a node by the scheduler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::common::{LoadBalancerType, LocalObjectReference, LocalUidReference};
use crate::internal::affinity::{Affinity, TopologySpreadConstraint};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "Instance",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(rename = "type", default)]
    pub type_: InstanceType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_type: Option<LoadBalancerType>,

    pub network_ref: LocalObjectReference,

    #[serde(default)]
    pub ips: Vec<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ref: Option<LocalUidReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,

    /// Node the instance is bound to; set by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum InstanceType {
    #[default]
    LoadBalancer,
}

/// Metadata stamped on instances created from a template.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,

    pub spec: InstanceSpec,
}

impl Instance {
    /// Node the instance is bound to, if scheduled.
    pub fn node_name(&self) -> Option<&str> {
        self.spec.node_ref.as_ref().map(|r| r.name.as_str())
    }
}
