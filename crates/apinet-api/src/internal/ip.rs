//! IP CRD
//!
//! Namespaced public IP. Either ephemeral (controlled by its claimer) or
//! standalone and reserved by setting `claimRef`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::common::IPFamily;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "core.apinet.ironcore.dev",
    version = "v1alpha1",
    kind = "IP",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    #[serde(rename = "type", default)]
    pub type_: IPType,

    pub ip_family: IPFamily,

    /// Assigned address. Allocated from the public prefix when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,

    /// Object currently holding this IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<IPClaimRef>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum IPType {
    #[default]
    Public,
}

/// Reference to the object holding an IP.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct IPClaimRef {
    #[serde(default)]
    pub group: String,

    pub resource: String,

    pub name: String,

    pub uid: String,
}

/// Public IP requested by a load balancer or network interface.
///
/// Exactly one of `ip_ref` (reserve an existing standalone IP) or neither
/// (allocate an ephemeral IP) is honoured; `ip` is filled in once the
/// address is known.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PublicIPRequest {
    /// Name of the request, unique within the owner
    pub name: String,

    pub ip_family: IPFamily,

    /// Allocated address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,

    /// Existing IP record to reserve instead of allocating an ephemeral one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_ref: Option<crate::common::LocalObjectReference>,
}

impl PublicIPRequest {
    pub fn ephemeral(name: impl Into<String>, ip_family: IPFamily) -> Self {
        Self {
            name: name.into(),
            ip_family,
            ip: None,
            ip_ref: None,
        }
    }
}

impl IP {
    /// Whether the IP is currently held by the object with `uid`.
    pub fn is_claimed_by(&self, uid: &str) -> bool {
        self.spec.claim_ref.as_ref().is_some_and(|c| c.uid == uid)
    }
}
