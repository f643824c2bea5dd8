//! Provider IDs
//!
//! Provider IDs link an upstream record to the internal record it was
//! translated into. They have the form
//! `ironcore-net://<namespace>/<name>/<extra>/<uid>` where `<extra>` is the
//! node name for network interfaces and the VNI for networks.

use std::fmt;
use thiserror::Error;

use crate::vni::{encode_vni, parse_vni};

/// Scheme of every provider ID issued by this control plane.
pub const PROVIDER_ID_SCHEME: &str = "ironcore-net";

const SCHEME_SEPARATOR: &str = "://";

/// Errors produced when parsing provider IDs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderIdError {
    #[error("provider id {id:?} does not use scheme {PROVIDER_ID_SCHEME}")]
    InvalidScheme { id: String },

    #[error("provider id {id:?} must have 4 non-empty segments, got {segments}")]
    InvalidSegments { id: String, segments: usize },

    #[error("provider id {id:?}: node {node:?} is not a DNS label")]
    InvalidNode { id: String, node: String },

    #[error("provider id {id:?}: {source}")]
    InvalidVni {
        id: String,
        #[source]
        source: crate::vni::VniError,
    },
}

/// Decoded network interface provider ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceId {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub uid: String,
}

/// Decoded network provider ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkId {
    pub namespace: String,
    pub name: String,
    pub vni: u32,
    pub uid: String,
}

impl fmt::Display for NetworkInterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(f, &self.namespace, &self.name, &self.node, &self.uid)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id(f, &self.namespace, &self.name, &encode_vni(self.vni), &self.uid)
    }
}

fn write_id(f: &mut fmt::Formatter<'_>, namespace: &str, name: &str, extra: &str, uid: &str) -> fmt::Result {
    write!(f, "{PROVIDER_ID_SCHEME}{SCHEME_SEPARATOR}{namespace}/{name}/{extra}/{uid}")
}

/// Builds the provider ID of an internal network interface.
pub fn make_network_interface_id(namespace: &str, name: &str, node: &str, uid: &str) -> String {
    NetworkInterfaceId {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node: node.to_string(),
        uid: uid.to_string(),
    }
    .to_string()
}

/// Parses the provider ID of an internal network interface.
pub fn parse_network_interface_id(id: &str) -> Result<NetworkInterfaceId, ProviderIdError> {
    let [namespace, name, node, uid] = split_segments(id)?;
    if !is_dns_label(node) {
        return Err(ProviderIdError::InvalidNode {
            id: id.to_string(),
            node: node.to_string(),
        });
    }
    Ok(NetworkInterfaceId {
        namespace: namespace.to_string(),
        name: name.to_string(),
        node: node.to_string(),
        uid: uid.to_string(),
    })
}

/// Builds the provider ID of an internal network.
pub fn make_network_id(namespace: &str, name: &str, vni: u32, uid: &str) -> String {
    NetworkId {
        namespace: namespace.to_string(),
        name: name.to_string(),
        vni,
        uid: uid.to_string(),
    }
    .to_string()
}

/// Parses the provider ID of an internal network.
pub fn parse_network_id(id: &str) -> Result<NetworkId, ProviderIdError> {
    let [namespace, name, vni, uid] = split_segments(id)?;
    let vni = parse_vni(vni).map_err(|source| ProviderIdError::InvalidVni {
        id: id.to_string(),
        source,
    })?;
    Ok(NetworkId {
        namespace: namespace.to_string(),
        name: name.to_string(),
        vni,
        uid: uid.to_string(),
    })
}

fn split_segments(id: &str) -> Result<[&str; 4], ProviderIdError> {
    let payload = id
        .strip_prefix(PROVIDER_ID_SCHEME)
        .and_then(|rest| rest.strip_prefix(SCHEME_SEPARATOR))
        .ok_or_else(|| ProviderIdError::InvalidScheme { id: id.to_string() })?;

    let segments: Vec<&str> = payload.split('/').collect();
    match segments.as_slice() {
        [a, b, c, d] if [a, b, c, d].iter().all(|s| !s.is_empty()) => Ok([*a, *b, *c, *d]),
        _ => Err(ProviderIdError::InvalidSegments {
            id: id.to_string(),
            segments: segments.len(),
        }),
    }
}

/// RFC 1123 DNS label: at most 63 lowercase alphanumerics or '-',
/// starting and ending with an alphanumeric.
pub fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes.iter().all(valid_char)
        && bytes.first() != Some(&b'-')
        && bytes.last() != Some(&b'-')
}
