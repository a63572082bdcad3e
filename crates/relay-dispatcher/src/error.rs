use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("channel dispatcher is shutting down")]
    ShuttingDown,
}

impl From<DispatchError> for relay_core::RelayError {
    fn from(err: DispatchError) -> Self {
        relay_core::RelayError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
