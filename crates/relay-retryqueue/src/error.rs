use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryQueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("retry queue item not found: {id}")]
    NotFound { id: String },
}

pub type Result<T> = std::result::Result<T, RetryQueueError>;
