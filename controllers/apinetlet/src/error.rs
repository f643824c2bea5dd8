//! apinetlet error types.

use apinet_api::ProviderIdError;
use apinet_client::ClientError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur while translating upstream records.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Store access error
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed provider ID
    #[error("Invalid provider ID: {0}")]
    InvalidProviderId(#[from] ProviderIdError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_conflict())
    }
}
