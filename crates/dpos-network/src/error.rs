//! Network error types.

use crate::message::Rpc;
use thiserror::Error;

/// Transport failure categories.
///
/// The category decides how the communicator treats the peer: validation
/// errors are logged only, every other kind counts towards disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The remote rejected our request payload.
    Validation,
    /// Generic socket failure.
    Generic,
    /// The transport's own deadline elapsed.
    Timeout,
    /// Anything else.
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportErrorKind::Validation => "validation",
            TransportErrorKind::Generic => "generic",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Status request returned nothing.
    #[error("No reply from {0}")]
    NoReply(String),

    /// Deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Config mismatch, incompatible version or failed fork check.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Reply failed schema validation.
    #[error("Protocol violation on {rpc}: {reason}")]
    ProtocolViolation { rpc: Rpc, reason: String },

    /// Transport failure.
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Outgoing rate limit exceeded.
    #[error("Rate limited on {rpc}, retry in {retry_after_ms}ms")]
    RateLimited { rpc: Rpc, retry_after_ms: u64 },

    /// Peer not in the repository.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer rejected by the acceptance pipeline.
    #[error("Peer rejected: {0}")]
    PeerRejected(String),

    /// DNS or NTP pre-flight failed.
    #[error("Connectivity check failed: {0}")]
    Connectivity(String),

    /// Invalid frame.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Chain collaborator failure.
    #[error("Chain error: {0}")]
    Chain(#[from] dpos_chain::ChainError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    /// Whether the error came from the peer's socket rather than its data.
    pub fn is_transport(&self) -> bool {
        matches!(self, NetworkError::Transport { .. } | NetworkError::Io(_))
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
