//! Node CRD
//!
//! Advertisement of a datapath node. Topology is carried in labels.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "Node"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {}
