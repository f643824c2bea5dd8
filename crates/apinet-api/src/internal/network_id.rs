//! NetworkID CRD
//!
//! Leaf of the VNI allocator. The object name is the decimal VNI.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::ClaimRef;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "NetworkID"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIDSpec {
    /// The VNI, identical to the object name
    pub id: String,

    /// Network holding this VNI
    pub claim_ref: ClaimRef,
}
