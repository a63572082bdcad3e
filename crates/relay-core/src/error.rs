use thiserror::Error;

/// Cross-cutting errors surfaced at the gateway/protocol boundary.
///
/// Subsystem crates (`relay-model`, `relay-memory`, `relay-channels`,
/// `relay-retryqueue`, ...) define their own narrower error enums and convert
/// into this one only at the point where an error becomes user-visible or
/// crosses into the HTTP/WS layer — never eagerly.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("channel error ({channel}): {reason}")]
    Channel { channel: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Short error code sent to clients in WS RES frames and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::AuthFailed(_) => "AUTH_FAILED",
            RelayError::Protocol(_) => "PROTOCOL_ERROR",
            RelayError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            RelayError::PermissionDenied { .. } => "PERMISSION_DENIED",
            RelayError::Database(_) => "DATABASE_ERROR",
            RelayError::Channel { .. } => "CHANNEL_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            RelayError::Timeout { .. } => "TIMEOUT",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Render a single plain-prose sentence safe to show a user: never a stack
    /// trace, a credential, or more than ~500 chars of the underlying cause.
    pub fn user_message(&self) -> String {
        let mut msg = match self {
            RelayError::Timeout { .. } => {
                "The request took too long and was cancelled.".to_string()
            }
            RelayError::PermissionDenied { .. } => {
                "You don't have permission to do that.".to_string()
            }
            RelayError::Channel { .. } => {
                "I ran into an error delivering that message.".to_string()
            }
            _ => "I ran into an error handling that.".to_string(),
        };
        if msg.len() > 500 {
            msg.truncate(500);
        }
        msg
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
