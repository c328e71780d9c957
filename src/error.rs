//! Error types for gateway operations

use crate::backend::BackendError;
use thiserror::Error;

/// Gateway operation result type
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse classification handed to the protocol layer
///
/// The host maps each class to a response; the engine never formats one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input caught before any backend call; never retried
    InvalidArgument,
    /// Target object or index absent
    NotFound,
    /// Backend could not launch the call, or a pre-launch ledger write failed
    ServiceUnavailable,
    /// Any other backend failure or exhausted internal bound
    InternalError,
    /// Client went away; detected at step boundaries only
    ClientAbort,
}

/// Gateway operation errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed request input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Content-MD5 did not match the received body
    #[error("Bad digest: expected {expected}, computed {computed}")]
    BadDigest { expected: String, computed: String },

    /// Object or index does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Retryable unavailability
    #[error("Service unavailable: {reason} (retry after {retry_after_secs}s)")]
    ServiceUnavailable {
        reason: String,
        retry_after_secs: u32,
    },

    /// Internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Object id collisions kept happening
    #[error("Failed to resolve object id collision {attempts} times for {seed}")]
    CollisionRetriesExhausted { seed: String, attempts: u32 },

    /// Fault mode ran out of fragments
    #[error("Write failed on fragment {last_fragment} with fragment limit {max_fragments} reached")]
    FragmentLimitExhausted {
        last_fragment: u32,
        max_fragments: u32,
    },

    /// Client disconnected mid-request
    #[error("Client aborted request")]
    ClientAbort,

    /// Backend operation failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Event loop waited too long for any completion
    #[error("Event loop stalled: {pending} joins pending after {waited_ms}ms")]
    Stalled { pending: usize, waited_ms: u64 },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration is not valid TOML
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Stored record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Retryable error for a draining process
    pub fn shutting_down() -> Self {
        GatewayError::ServiceUnavailable {
            reason: "gateway is shutting down".to_string(),
            retry_after_secs: 1,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        GatewayError::ServiceUnavailable {
            reason: reason.into(),
            retry_after_secs: 1,
        }
    }

    /// Classify for the protocol layer
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::InvalidArgument(_)
            | GatewayError::BadDigest { .. }
            | GatewayError::Config(_)
            | GatewayError::ConfigParse(_) => ErrorClass::InvalidArgument,
            GatewayError::NotFound(_) => ErrorClass::NotFound,
            GatewayError::ServiceUnavailable { .. } => ErrorClass::ServiceUnavailable,
            GatewayError::ClientAbort => ErrorClass::ClientAbort,
            GatewayError::Backend(e) => match e {
                BackendError::NotFound => ErrorClass::NotFound,
                BackendError::LaunchFailed(_) => ErrorClass::ServiceUnavailable,
                _ => ErrorClass::InternalError,
            },
            GatewayError::Internal(_)
            | GatewayError::CollisionRetriesExhausted { .. }
            | GatewayError::FragmentLimitExhausted { .. }
            | GatewayError::Stalled { .. }
            | GatewayError::Serialization(_)
            | GatewayError::Io(_) => ErrorClass::InternalError,
        }
    }

    /// Retry-after hint, present only for the unavailable class
    pub fn retry_after_secs(&self) -> Option<u32> {
        match self {
            GatewayError::ServiceUnavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            GatewayError::Backend(BackendError::LaunchFailed(_)) => Some(1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            GatewayError::InvalidArgument("k".into()).class(),
            ErrorClass::InvalidArgument
        );
        assert_eq!(
            GatewayError::from(BackendError::NotFound).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            GatewayError::from(BackendError::LaunchFailed("enomem".into())).class(),
            ErrorClass::ServiceUnavailable
        );
        assert_eq!(
            GatewayError::from(BackendError::Timeout).class(),
            ErrorClass::InternalError
        );
        assert_eq!(
            GatewayError::CollisionRetriesExhausted {
                seed: "/b/k".into(),
                attempts: 20
            }
            .class(),
            ErrorClass::InternalError
        );
        assert_eq!(GatewayError::ClientAbort.class(), ErrorClass::ClientAbort);
    }

    #[test]
    fn test_retry_after_only_for_unavailable() {
        assert_eq!(GatewayError::shutting_down().retry_after_secs(), Some(1));
        assert_eq!(GatewayError::Internal("x".into()).retry_after_secs(), None);
    }
}
