//! Sync error types.

use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] dpos_network::NetworkError),

    /// Chain error.
    #[error("Chain error: {0}")]
    Chain(#[from] dpos_chain::ChainError),

    /// No peers available.
    #[error("No peers available")]
    NoPeers,
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
