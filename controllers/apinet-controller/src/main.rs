//! apinet controller
//!
//! Runs the controllers that own the internal network store:
//! - Network / NetworkID: VNI allocation, peering status and ID GC
//! - IP / IPAddress / NetworkInterface: public IP allocation and GC
//! - LoadBalancer / DaemonSet / Instance: per-node load balancer instances
//! - NATGateway / NATGatewayAutoscaler / NATTable: SNAT port slots
//! - NetworkPolicy: resolved NetworkPolicyRule objects
//! - the instance scheduler and node certificate approval

mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod expectations;
mod names;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube picks the process-wide provider; ring matches the workspace features
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting apinet controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  VNI range: {:?}", config.vni_range);
    info!("  Public prefixes: {}", config.public_prefixes.len());
    info!("  Ports per network interface: {}", config.default_ports_per_network_interface);
    info!("  CSR approval: {}", config.csr_approver_enabled);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
