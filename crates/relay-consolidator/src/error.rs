use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsolidatorError {
    #[error("{0}")]
    Memory(#[from] relay_memory::MemoryError),

    #[error("{0}")]
    Session(#[from] relay_sessions::SessionError),

    #[error("{0}")]
    Model(#[from] relay_model::ModelError),
}

pub type Result<T> = std::result::Result<T, ConsolidatorError>;
