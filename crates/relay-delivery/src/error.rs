use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("channel not registered: {0}")]
    UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
