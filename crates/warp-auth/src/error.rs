//! Error types for identity operations

/// Errors from identity and token operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("identity provider rejected the request: {0}")]
    Provider(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("mailbox API error: {0}")]
    Mailbox(String),

    #[error("challenge mail did not arrive within {0} seconds")]
    ChallengeTimeout(u64),

    #[error("response parse error: {0}")]
    Parse(String),
}

/// Result alias for identity operations.
pub type Result<T> = std::result::Result<T, Error>;
