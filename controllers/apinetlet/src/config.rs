//! apinetlet configuration from environment variables.

use std::env;
use std::path::PathBuf;

use crate::error::ControllerError;

/// Upper bound on the public IPs of a translated NAT gateway.
pub const DEFAULT_NAT_GATEWAY_MAX_PUBLIC_IPS: i32 = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// Internal-store namespace every translated record is written to
    pub apinet_namespace: String,
    /// Upstream namespace to watch; all namespaces when unset
    pub upstream_namespace: Option<String>,
    /// Kubeconfig of the internal store; the in-cluster client when unset
    pub apinet_kubeconfig: Option<PathBuf>,
    pub nat_gateway_max_public_ips: i32,
}

impl Config {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let apinet_namespace = non_empty("APINET_NAMESPACE").ok_or_else(|| {
            ControllerError::InvalidConfig("APINET_NAMESPACE environment variable is required".to_string())
        })?;

        let nat_gateway_max_public_ips = match non_empty("NAT_GATEWAY_MAX_PUBLIC_IPS") {
            None => DEFAULT_NAT_GATEWAY_MAX_PUBLIC_IPS,
            Some(raw) => raw
                .parse()
                .ok()
                .filter(|max: &i32| *max >= 1)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("NAT_GATEWAY_MAX_PUBLIC_IPS={raw:?} must be a positive integer"))
                })?,
        };

        Ok(Self {
            apinet_namespace,
            upstream_namespace: non_empty("UPSTREAM_NAMESPACE"),
            apinet_kubeconfig: non_empty("APINET_KUBECONFIG").map(PathBuf::from),
            nat_gateway_max_public_ips,
        })
    }
}
