//! Error types for mercury-link.

use thiserror::Error;

/// Errors surfaced by the realtime client and the request batcher.
///
/// The enum is `Clone` because a single outcome may be fanned out to every
/// waiter that shares a request fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MercuryError {
    /// Socket-level failure to open or keep a connection. Always retryable.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The server rejected the credentials presented during the handshake.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The server said something the client does not understand.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// No response was obtained for a bulk request after all retries.
    #[error("Batch could not be sent: {0}")]
    BatchNetworkError(String),

    /// The server rejected one specific item of a bulk request.
    #[error("Batch item '{fingerprint}' rejected: {reason}")]
    BatchItemError { fingerprint: String, reason: String },

    /// A non-success HTTP status for a whole request.
    #[error("Server error {status_code}: {message}")]
    ServerError { status_code: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation was abandoned, e.g. by `disconnect()` or shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl MercuryError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportError(_) | Self::TimeoutError(_) | Self::BatchNetworkError(_)
        )
    }

    /// Whether the error must stop automatic reconnection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolError(_) | Self::ConfigurationError(_))
    }
}

impl From<serde_json::Error> for MercuryError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for MercuryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else if let Some(status) = err.status() {
            Self::ServerError {
                status_code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::TransportError(err.to_string())
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MercuryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MercuryError::TransportError("reset".into()).is_retryable());
        assert!(MercuryError::TimeoutError("slow".into()).is_retryable());
        assert!(MercuryError::BatchNetworkError("offline".into()).is_retryable());
        assert!(!MercuryError::ProtocolError("bad frame".into()).is_retryable());
        assert!(!MercuryError::AuthenticationError("expired".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MercuryError::ProtocolError("forbidden".into()).is_fatal());
        assert!(!MercuryError::TransportError("reset".into()).is_fatal());
    }

    #[test]
    fn test_item_error_display_names_fingerprint() {
        let err = MercuryError::BatchItemError {
            fingerprint: "uuid-80".into(),
            reason: "not found".into(),
        };
        assert_eq!(err.to_string(), "Batch item 'uuid-80' rejected: not found");
    }
}
