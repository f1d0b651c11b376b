//! Error types for lease pool operations.
//!
//! Backends map their transport failures onto these variants so that the
//! elector and the components consuming leases never see backend internals.

use thiserror::Error;

/// Top-level error type for the lease-pool crate.
#[derive(Debug, Error)]
pub enum LeasePoolError {
    /// Connection or transport-level failure talking to the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the backend.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A stored lease record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid lease options or backend configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The client is not connected or the connection was lost.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The lease key is not usable by the backend.
    #[error("invalid lease key '{0}'")]
    InvalidKey(String),

    /// The handle already has a live watch subscription.
    #[error("lease '{0}' is already being watched")]
    AlreadyWatching(String),
}

impl LeasePoolError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on the next renewal attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeasePoolError::Transport(_) | LeasePoolError::Timeout(_)
        )
    }
}

/// Shorthand result alias for lease pool operations.
pub type LeasePoolResult<T> = Result<T, LeasePoolError>;
