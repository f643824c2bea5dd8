//! Controller-specific error types.
//!
//! Store and allocator errors are wrapped so the error policy can tell
//! conflicts (requeue right away) from everything else (back off).

use apinet_allocator::AllocationError;
use apinet_api::ProviderIdError;
use apinet_client::ClientError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the apinet controllers.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Store access error
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Allocation failed
    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed provider ID
    #[error("Invalid provider ID: {0}")]
    InvalidProviderId(#[from] ProviderIdError),

    /// Another writer got there first
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// No node can host an instance
    #[error("Scheduling failed: {0}")]
    Scheduling(String),
}

impl ControllerError {
    /// Optimistic-concurrency collisions, wherever they surfaced.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Client(e) => e.is_conflict(),
            Self::Allocation(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Client(e) => e.is_not_found(),
            Self::Allocation(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_are_recognised_through_wrappers() {
        assert!(ControllerError::Conflict("x".to_string()).is_conflict());
        assert!(ControllerError::from(ClientError::Conflict("x".to_string())).is_conflict());
        assert!(ControllerError::from(AllocationError::Client(ClientError::Conflict("x".to_string()))).is_conflict());
        assert!(!ControllerError::InvalidConfig("x".to_string()).is_conflict());
    }

    #[test]
    fn test_not_found() {
        assert!(ControllerError::from(ClientError::NotFound("x".to_string())).is_not_found());
        assert!(!ControllerError::Scheduling("x".to_string()).is_not_found());
    }
}
