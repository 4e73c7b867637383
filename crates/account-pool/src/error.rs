//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// All-or-nothing allocation could not be satisfied. Recoverable:
    /// the caller retries or waits for replenishment.
    #[error("insufficient pool: requested {requested}, available {available}")]
    InsufficientPool { requested: usize, available: usize },

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("lease on account {0} is held by another requester")]
    NotOwner(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("account store error: {0}")]
    Store(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
