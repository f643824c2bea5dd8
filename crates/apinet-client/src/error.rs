//! Store client errors

use thiserror::Error;

/// Errors that can occur when talking to a declarative store
#[derive(Debug, Error)]
pub enum ClientError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency collision (stale resource version)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object was rejected by validation
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Any other API or transport failure
    #[error("Kubernetes API error: {0}")]
    Kube(kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::NotFound(resp.message),
                409 if resp.reason == "AlreadyExists" => Self::AlreadyExists(resp.message),
                409 => Self::Conflict(resp.message),
                422 => Self::Invalid(resp.message),
                _ => Self::Kube(kube::Error::Api(resp)),
            },
            other => Self::Kube(other),
        }
    }
}

/// Maps `NotFound` to `None`.
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, ClientError>;
}

impl<T> OptionalExt<T> for Result<T, ClientError> {
    fn optional(self) -> Result<Option<T>, ClientError> {
        match self {
            Ok(obj) => Ok(Some(obj)),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Swallows `NotFound`, e.g. for best-effort deletes.
pub fn ignore_not_found(result: Result<(), ClientError>) -> Result<(), ClientError> {
    match result {
        Err(ClientError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classifies_api_errors() {
        assert!(ClientError::from(api_error(404, "NotFound")).is_not_found());
        assert!(ClientError::from(api_error(409, "AlreadyExists")).is_already_exists());
        assert!(ClientError::from(api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            ClientError::from(api_error(422, "Invalid")),
            ClientError::Invalid(_)
        ));
        assert!(matches!(
            ClientError::from(api_error(500, "InternalError")),
            ClientError::Kube(_)
        ));
    }

    #[test]
    fn test_optional() {
        let missing: Result<u32, ClientError> = Err(ClientError::NotFound("x".to_string()));
        assert_eq!(missing.optional().unwrap(), None);
        let present: Result<u32, ClientError> = Ok(1);
        assert_eq!(present.optional().unwrap(), Some(1));
        assert!(ignore_not_found(Err(ClientError::NotFound("x".to_string()))).is_ok());
        assert!(ignore_not_found(Err(ClientError::Conflict("x".to_string()))).is_err());
    }
}
