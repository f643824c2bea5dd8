//! apinetlet
//!
//! Translates the upstream networking records of a cluster into the apinet
//! internal store and projects their progress back:
//! - Network: internal network, peerings and provider ID
//! - NetworkInterface: public IPs, prefixes and status of realised interfaces
//! - VirtualIP / LoadBalancer / NATGateway / NetworkPolicy: internal records
//! - garbage collection of internal records whose source is gone

mod backoff;
mod config;
mod controller;
mod error;
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
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting apinetlet");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Apinet namespace: {}", config.apinet_namespace);
    info!(
        "  Upstream namespace: {}",
        config.upstream_namespace.as_deref().unwrap_or("all namespaces")
    );
    info!(
        "  Apinet kubeconfig: {}",
        config
            .apinet_kubeconfig
            .as_ref()
            .map_or_else(|| "in-cluster".to_string(), |p| p.display().to_string())
    );
    info!("  NAT gateway max public IPs: {}", config.nat_gateway_max_public_ips);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
