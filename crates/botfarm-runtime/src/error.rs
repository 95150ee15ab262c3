//! Error taxonomy shared by the lease engine, the directory and the auth gate.

use thiserror::Error;

use crate::identity::ResourceId;

/// Errors surfaced by every store-facing operation.
///
/// None of these are retried inside the crate: conflicts and exhaustion are
/// pushed back to the caller, store failures are always propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("resource already locked: {0}")]
    Conflict(ResourceId),
    #[error("no free resource available")]
    ResourceExhausted,
    #[error("User with this login already exists.")]
    DuplicateLogin(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("store error: {0}")]
    Store(String),
}

impl LeaseError {
    /// Message shown to API callers. Store details are not leaked.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(_) => "resource not found".to_string(),
            Self::Conflict(_) => "resource already locked".to_string(),
            Self::ResourceExhausted => "no free resource available".to_string(),
            Self::DuplicateLogin(_) => "User with this login already exists.".to_string(),
            Self::Validation(msg) => msg.clone(),
            Self::Unauthorized(msg) => msg.clone(),
            Self::Store(_) => "internal store error".to_string(),
        }
    }
}

pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> LeaseError {
    LeaseError::Store(format!("{prefix}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_driver_details() {
        let err = map_driver_err("acquire lease", "connection reset by peer");
        assert_eq!(
            err,
            LeaseError::Store("acquire lease: connection reset by peer".into())
        );
        assert_eq!(err.public_message(), "internal store error");
    }

    #[test]
    fn lease_errors_carry_caller_facing_messages() {
        let id = ResourceId::new();
        assert_eq!(LeaseError::NotFound(id).public_message(), "resource not found");
        assert_eq!(
            LeaseError::Conflict(id).public_message(),
            "resource already locked"
        );
        assert_eq!(
            LeaseError::ResourceExhausted.public_message(),
            "no free resource available"
        );
    }
}
