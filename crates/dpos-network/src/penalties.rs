//! How RPC failures count against a peer.
//!
//! Each failed request is classified into an [`ErrorPolicy`]. Malformed
//! replies and rejected requests are the peer's data problem and are only
//! logged; socket-level failures accumulate in the peer's sequential error
//! counter; unexpected failures disconnect straight away.

use crate::error::{NetworkError, TransportErrorKind};

/// Default number of sequential errors before a peer is disconnected.
pub const DEFAULT_MAX_SEQUENTIAL_ERRORS: u32 = 3;

/// What a failed request does to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log, leave the peer alone.
    LogOnly,
    /// Increment the sequential error counter, disconnect at the threshold.
    Count,
    /// Increment the counter and disconnect.
    Disconnect,
}

impl ErrorPolicy {
    /// Classify a request failure.
    pub fn classify(error: &NetworkError) -> Self {
        match error {
            NetworkError::ProtocolViolation { .. }
            | NetworkError::RateLimited { .. }
            | NetworkError::VerificationFailed(_)
            | NetworkError::PeerNotFound(_)
            | NetworkError::PeerRejected(_)
            | NetworkError::Connectivity(_)
            | NetworkError::Chain(_) => ErrorPolicy::LogOnly,

            NetworkError::Transport { kind, .. } => match kind {
                TransportErrorKind::Validation => ErrorPolicy::LogOnly,
                TransportErrorKind::Generic | TransportErrorKind::Timeout => ErrorPolicy::Count,
                TransportErrorKind::Other => ErrorPolicy::Disconnect,
            },

            NetworkError::NoReply(_) | NetworkError::Timeout(_) | NetworkError::Io(_) => {
                ErrorPolicy::Count
            }

            NetworkError::InvalidMessage(_)
            | NetworkError::MessageTooLarge { .. }
            | NetworkError::Serialization(_) => ErrorPolicy::Disconnect,
        }
    }

    /// Whether the failure increments the sequential error counter.
    pub fn counts(&self) -> bool {
        !matches!(self, ErrorPolicy::LogOnly)
    }

    /// Whether to disconnect given the counter after incrementing.
    pub fn should_disconnect(&self, counter: u32, max_sequential_errors: u32) -> bool {
        match self {
            ErrorPolicy::LogOnly => false,
            ErrorPolicy::Count => counter >= max_sequential_errors,
            ErrorPolicy::Disconnect => true,
        }
    }
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::LogOnly => write!(f, "log only"),
            ErrorPolicy::Count => write!(f, "count"),
            ErrorPolicy::Disconnect => write!(f, "disconnect"),
        }
    }
}
