//! Allocation errors

use apinet_api::VniError;
use apinet_client::ClientError;
use thiserror::Error;

/// Errors that can occur while allocating or releasing resources
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The requested VNI or address is held by someone else
    #[error("{0} is already allocated")]
    AlreadyAllocated(String),

    /// The requested VNI or address lies outside every configured range
    #[error("{0} is out of range")]
    OutOfRange(String),

    /// Every candidate of the pool is taken
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Allocator configuration is malformed
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The IP record is claimed by another object
    #[error("IP {name} is claimed by {claimer}")]
    Claimed { name: String, claimer: String },

    /// Store access failed
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl AllocationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_not_found())
    }

    /// Errors that retrying with the same input cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::OutOfRange(_) | Self::InvalidRange(_) | Self::Claimed { .. })
    }
}

impl From<VniError> for AllocationError {
    fn from(err: VniError) -> Self {
        match err {
            VniError::InvalidRange { .. } => Self::InvalidRange(err.to_string()),
            VniError::Malformed(_) | VniError::OutOfRange { .. } => Self::OutOfRange(err.to_string()),
        }
    }
}
