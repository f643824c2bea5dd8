//! Well-known label keys and the source-label triple.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// IP family index label on `IP` records.
pub const IP_FAMILY_LABEL: &str = "apinet.ironcore.dev/ip-family";

/// Dashed-address index label on `IP` records.
pub const IP_LABEL: &str = "apinet.ironcore.dev/ip";

/// Hash of the instance template a daemon set stamped on an instance.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "apinet.ironcore.dev/controller-revision-hash";

/// Name of the load balancer an instance / daemon set serves.
pub const LOAD_BALANCER_NAME_LABEL: &str = "apinet.ironcore.dev/load-balancer-name";

/// Namespace of the upstream record a child was translated from.
pub const SOURCE_NAMESPACE_LABEL: &str = "apinetlet.apinet.ironcore.dev/source-namespace";

/// Name of the upstream record a child was translated from.
pub const SOURCE_NAME_LABEL: &str = "apinetlet.apinet.ironcore.dev/source-name";

/// UID of the upstream record a child was translated from.
pub const SOURCE_UID_LABEL: &str = "apinetlet.apinet.ironcore.dev/source-uid";

/// Topology label carrying a node's zone.
pub const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Field-owner used for server-side apply by the apinet controllers.
pub const APINET_FIELD_OWNER: &str = "apinet.ironcore.dev/controller-manager";

/// Field-owner used for server-side apply by the apinetlet.
pub const APINETLET_FIELD_OWNER: &str = "apinetlet.apinet.ironcore.dev/controller-manager";

/// Identity of the upstream record a translated child points back to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl SourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Label triple written on every child.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SOURCE_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
            (SOURCE_NAME_LABEL.to_string(), self.name.clone()),
            (SOURCE_UID_LABEL.to_string(), self.uid.clone()),
        ])
    }

    /// Reads the triple back; all three labels must be present.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            namespace: labels.get(SOURCE_NAMESPACE_LABEL)?.clone(),
            name: labels.get(SOURCE_NAME_LABEL)?.clone(),
            uid: labels.get(SOURCE_UID_LABEL)?.clone(),
        })
    }

    /// Equality selector matching every child of this source.
    pub fn selector(&self) -> BTreeMap<String, String> {
        self.labels()
    }
}

/// Encodes an address as a label value: `10.0.0.1` becomes `10-0-0-1`,
/// `fd00::1` becomes `fd00--1`.
pub fn dashed_ip(ip: &IpAddr) -> String {
    ip.to_string().replace(['.', ':'], "-")
}

/// Object name of the `IPAddress` leaf for an address.
///
/// IPv4 addresses use their canonical form. IPv6 addresses are written
/// fully expanded with dashes so the name is a valid object name.
pub fn ip_address_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|s| format!("{s:04x}"))
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Inverse of [`ip_address_name`].
pub fn parse_ip_address_name(name: &str) -> Option<IpAddr> {
    if let Ok(ip) = name.parse::<std::net::Ipv4Addr>() {
        return Some(IpAddr::V4(ip));
    }
    let segments: Vec<u16> = name
        .split('-')
        .map(|s| (s.len() == 4).then(|| u16::from_str_radix(s, 16).ok()).flatten())
        .collect::<Option<_>>()?;
    let segments: [u16; 8] = segments.try_into().ok()?;
    Some(IpAddr::V6(std::net::Ipv6Addr::from(segments)))
}
