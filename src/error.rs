//! Error types for the pivot reconciler

use thiserror::Error;

/// Main error type for the reconciler
#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_id} is not configured")]
    UnknownChain { chain_id: u64 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Indexer error from {indexer}: {message}")]
    Indexer { indexer: String, message: String },

    #[error("Rate limited by {indexer}")]
    RateLimited { indexer: String },

    #[error("Event decoding error: {0}")]
    EventDecoding(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("A {kind} session for pool {pool} is already active")]
    SessionAlreadyActive { pool: String, kind: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReconcilerError {
    /// Check if error is transient and should be retried on the normal schedule
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcilerError::ChainConnection { .. }
                | ReconcilerError::Indexer { .. }
                | ReconcilerError::RateLimited { .. }
                | ReconcilerError::Http(_)
        )
    }

    /// Check if error is a configuration problem that must be surfaced to the caller
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ReconcilerError::Config(_)
                | ReconcilerError::UnknownChain { .. }
                | ReconcilerError::InvalidOperation(_)
        )
    }
}

/// Result type for reconciler operations
pub type ReconcilerResult<T> = Result<T, ReconcilerError>;
