use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnterpriseError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Channel(#[from] relay_channels::ChannelError),
}

pub type Result<T> = std::result::Result<T, EnterpriseError>;
