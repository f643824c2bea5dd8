//! IPAddress CRD
//!
//! Leaf of the public-prefix allocator. The object name encodes the
//! address (see `labels::ip_address_name`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::ClaimRef;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "IPAddress"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    /// The allocated address
    pub ip: IpAddr,

    /// IP record holding this address
    pub claim_ref: ClaimRef,
}
