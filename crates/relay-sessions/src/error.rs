use thiserror::Error;

/// Errors that can occur during agent session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("agent session not found on channel {channel}")]
    NotFound { channel: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid agent session state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
