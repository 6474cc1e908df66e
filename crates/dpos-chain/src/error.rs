//! Error types for chain data and collaborators.

use thiserror::Error;

/// Chain errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Invalid block.
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Invalid transaction.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Block does not extend the current tip.
    #[error("Block {height} does not extend tip {tip}")]
    NotLinked { height: u32, tip: u32 },

    /// Invalid milestone configuration.
    #[error("Invalid milestones: {0}")]
    InvalidMilestones(String),

    /// Storage backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
