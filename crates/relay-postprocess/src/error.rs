use thiserror::Error;

#[derive(Debug, Error)]
pub enum PostprocessError {
    #[error("pending action not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PostprocessError>;
