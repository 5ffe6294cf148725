//! Error types for registry blob transfers
//!
//! Every failure a transfer can hit is one [`TransferError`] variant. The
//! variants double as the retry classification used by the transfer loops:
//! see [`TransferError::class`].

pub mod handlers;

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Caller cancelled the session or its deadline passed
    #[error("operation cancelled")]
    Cancelled,

    /// No bytes arrived within the stall timeout
    #[error("transfer stalled: no data received for {0:?}")]
    Stalled(Duration),

    /// Throughput dropped below the adaptive threshold
    #[error("transfer too slow: {observed:.0} B/s below threshold {threshold:.0} B/s")]
    Slow { observed: f64, threshold: f64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{context} failed with status {status}: {message}")]
    Status {
        status: u16,
        context: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The token exchange callback failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Registry asked for credentials but no token source was configured
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The registry broke the protocol contract (missing header, bad location)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("max retries exceeded: {last}")]
    MaxRetriesExceeded { last: Box<TransferError> },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Terminal failure of one blob, tagged with the operation that failed
    #[error("{operation} {digest}: {source}")]
    Blob {
        operation: &'static str,
        digest: String,
        #[source]
        source: Box<TransferError>,
    },
}

/// How the retry loop treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Abort immediately and propagate verbatim
    Cancelled,
    /// Retry without consuming the attempt budget
    Stalled,
    /// Retry; consume budget after consecutive slow observations
    Slow,
    /// Retry and consume one attempt
    Transient,
    /// Never retry
    Terminal,
}

impl TransferError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransferError::Cancelled => FailureClass::Cancelled,
            TransferError::Stalled(_) => FailureClass::Stalled,
            TransferError::Slow { .. } => FailureClass::Slow,
            TransferError::ProtocolViolation(_)
            | TransferError::Unauthorized(_)
            | TransferError::MaxRetriesExceeded { .. }
            | TransferError::Validation(_) => FailureClass::Terminal,
            TransferError::Blob { source, .. } => source.class(),
            _ => FailureClass::Transient,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.class() == FailureClass::Cancelled
    }

    /// Tag a terminal error with the failing operation and blob
    pub fn for_blob(self, operation: &'static str, digest: &str) -> Self {
        match self {
            TransferError::Cancelled | TransferError::Blob { .. } => self,
            other => TransferError::Blob {
                operation,
                digest: digest.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "request")
    }
}

impl From<url::ParseError> for TransferError {
    fn from(err: url::ParseError) -> Self {
        TransferError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_retry_policy() {
        assert_eq!(TransferError::Cancelled.class(), FailureClass::Cancelled);
        assert_eq!(
            TransferError::Stalled(Duration::from_secs(10)).class(),
            FailureClass::Stalled
        );
        assert_eq!(
            TransferError::Slow { observed: 1.0, threshold: 2.0 }.class(),
            FailureClass::Slow
        );
        assert_eq!(
            TransferError::Network("reset".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            TransferError::ProtocolViolation("no upload location".into()).class(),
            FailureClass::Terminal
        );
    }

    #[test]
    fn blob_wrapper_keeps_cancellation_verbatim() {
        let err = TransferError::Cancelled.for_blob("upload", "sha256:abc");
        assert!(matches!(err, TransferError::Cancelled));

        let err = TransferError::Network("boom".into()).for_blob("download", "sha256:abc");
        assert_eq!(err.to_string(), "download sha256:abc: Network error: boom");
    }
}
