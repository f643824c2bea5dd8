//! DaemonSet CRD
//!
//! Runs one instance per eligible node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::internal::instance::InstanceTemplate;
use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "DaemonSet",
    namespaced,
    status = "DaemonSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetSpec {
    /// Selector over the instances managed by the daemon set
    pub selector: LabelSelector,

    pub template: InstanceTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    /// Bumped when a revision hash collides with an existing one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Nodes that should run an instance
    #[serde(default)]
    pub desired_number_scheduled: i32,

    /// Nodes running at least one instance
    #[serde(default)]
    pub current_number_scheduled: i32,
}
