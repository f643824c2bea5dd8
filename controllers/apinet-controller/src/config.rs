//! Controller configuration from environment variables.

use apinet_api::internal::{DEFAULT_PORTS_PER_NETWORK_INTERFACE, MAX_EPHEMERAL_PORT, MIN_EPHEMERAL_PORT};
use apinet_api::vni::{DEFAULT_MIN_VNI, MAX_VNI};
use apinet_api::{IPFamily, VniRange};
use ipnet::IpNet;
use std::env;
use std::time::Duration;

use crate::error::ControllerError;

/// Public prefix used when `PUBLIC_PREFIXES` is unset.
pub const DEFAULT_PUBLIC_PREFIX: &str = "10.0.0.0/24";

/// Smallest accepted port block.
pub const MIN_PORTS_PER_NETWORK_INTERFACE: i32 = 64;

/// Default expectation timeout.
pub const DEFAULT_EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    pub vni_range: VniRange,
    /// At most one prefix per IP family
    pub public_prefixes: Vec<IpNet>,
    pub default_ports_per_network_interface: i32,
    pub expectation_timeout: Duration,
    pub csr_approver_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            vni_range: VniRange::default(),
            public_prefixes: DEFAULT_PUBLIC_PREFIX.parse().into_iter().collect(),
            default_ports_per_network_interface: DEFAULT_PORTS_PER_NETWORK_INTERFACE,
            expectation_timeout: DEFAULT_EXPECTATION_TIMEOUT,
            csr_approver_enabled: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let min_vni = parse_or(&lookup, "MIN_VNI", DEFAULT_MIN_VNI)?;
        let max_vni = parse_or(&lookup, "MAX_VNI", MAX_VNI)?;
        let vni_range = VniRange::new(min_vni, max_vni).map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

        let public_prefixes = parse_prefixes(lookup("PUBLIC_PREFIXES").as_deref().unwrap_or(DEFAULT_PUBLIC_PREFIX))?;

        let ports = parse_or(
            &lookup,
            "DEFAULT_PORTS_PER_NETWORK_INTERFACE",
            DEFAULT_PORTS_PER_NETWORK_INTERFACE,
        )?;
        validate_ports_per_network_interface(ports)?;

        let timeout_secs = parse_or(&lookup, "EXPECTATION_TIMEOUT_SECS", DEFAULT_EXPECTATION_TIMEOUT.as_secs())?;

        Ok(Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            vni_range,
            public_prefixes,
            default_ports_per_network_interface: ports,
            expectation_timeout: Duration::from_secs(timeout_secs),
            csr_approver_enabled: parse_or(&lookup, "CSR_APPROVER_ENABLED", true)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key}={raw:?} is malformed"))),
    }
}

fn parse_prefixes(raw: &str) -> Result<Vec<IpNet>, ControllerError> {
    let mut prefixes: Vec<IpNet> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let prefix: IpNet = part
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("public prefix {part:?}: {e}")))?;
        let family = IPFamily::of(&prefix.addr());
        if prefixes.iter().any(|p| IPFamily::of(&p.addr()) == family) {
            return Err(ControllerError::InvalidConfig(format!(
                "more than one {family} public prefix configured"
            )));
        }
        prefixes.push(prefix.trunc());
    }
    if prefixes.is_empty() {
        return Err(ControllerError::InvalidConfig("no public prefix configured".to_string()));
    }
    Ok(prefixes)
}

/// A block size must be a power of two that fits the ephemeral range.
pub fn validate_ports_per_network_interface(ports: i32) -> Result<(), ControllerError> {
    let max = MAX_EPHEMERAL_PORT - MIN_EPHEMERAL_PORT + 1;
    if ports < MIN_PORTS_PER_NETWORK_INTERFACE || ports > max || (ports & (ports - 1)) != 0 {
        return Err(ControllerError::InvalidConfig(format!(
            "ports per network interface must be a power of two in [{MIN_PORTS_PER_NETWORK_INTERFACE}, {max}], got {ports}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.vni_range, VniRange::default());
        assert_eq!(config.public_prefixes, vec!["10.0.0.0/24".parse::<IpNet>().unwrap()]);
        assert_eq!(config.default_ports_per_network_interface, 2048);
        assert_eq!(config.expectation_timeout, Duration::from_secs(300));
        assert!(config.watch_namespace.is_none());
        assert!(config.csr_approver_enabled);
    }

    #[test]
    fn test_rejects_single_vni_range() {
        let err = Config::from_lookup(lookup(&[("MIN_VNI", "500"), ("MAX_VNI", "500")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_prefixes_one_per_family() {
        let config = Config::from_lookup(lookup(&[("PUBLIC_PREFIXES", "10.1.0.0/16, fd00::/64")])).unwrap();
        assert_eq!(config.public_prefixes.len(), 2);

        let err = Config::from_lookup(lookup(&[("PUBLIC_PREFIXES", "10.1.0.0/16,10.2.0.0/16")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_ports_per_network_interface() {
        assert!(validate_ports_per_network_interface(64).is_ok());
        assert!(validate_ports_per_network_interface(64512).is_err());
        assert!(validate_ports_per_network_interface(32768).is_ok());
        assert!(validate_ports_per_network_interface(100).is_err());
        assert!(validate_ports_per_network_interface(32).is_err());
    }

    #[test]
    fn test_malformed_values() {
        assert!(Config::from_lookup(lookup(&[("MIN_VNI", "abc")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CSR_APPROVER_ENABLED", "maybe")])).is_err());
    }
}
