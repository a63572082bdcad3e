use thiserror::Error;

/// Errors surfaced by the Model Gateway, Context Assembler, and Response
/// Pipeline. Every user-turn-facing variant here maps to one of the
/// propagation-policy buckets: retry locally, surface a plain-prose
/// sentence, or log and move on — never a panic inside a turn.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model subprocess not found at '{path}' — install it first")]
    BinaryNotFound { path: String },

    #[error("failed to spawn model subprocess: {0}")]
    Spawn(String),

    #[error("model subprocess timed out after {ms}ms")]
    Timeout { ms: u64, partial_output: String },

    #[error("model subprocess was terminated externally")]
    ExternalKill { partial_output: String },

    #[error("model subprocess exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("I/O error talking to model subprocess: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to persist model session: {0}")]
    SessionPersist(String),

    #[error("a context fragment fetch failed: {0}")]
    ContextFetch(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Memory(#[from] relay_memory::MemoryError),

    #[error("{0}")]
    Session(#[from] relay_sessions::SessionError),

    #[error("{0}")]
    Delivery(#[from] relay_delivery::DeliveryError),

    #[error("{0}")]
    Channel(#[from] relay_channels::ChannelError),
}

impl ModelError {
    /// A single plain-prose sentence safe to show a user — never a stack
    /// trace, a raw stderr dump beyond ~500 chars, or a credential.
    pub fn user_message(&self) -> String {
        let mut msg = match self {
            ModelError::BinaryNotFound { .. } => {
                "The model isn't available right now — please try again later.".to_string()
            }
            ModelError::Timeout { ms, partial_output } => {
                format_partial(&format!("Task timed out after {ms}ms."), partial_output)
            }
            ModelError::ExternalKill { partial_output } => {
                format_partial("That got interrupted.", partial_output)
            }
            ModelError::NonZeroExit { stderr, .. } => {
                format!("Error: {}", truncate(stderr, 500))
            }
            _ => "I ran into an error handling that.".to_string(),
        };
        if msg.len() > 500 {
            msg.truncate(500);
        }
        msg
    }
}

fn format_partial(prefix: &str, partial: &str) -> String {
    if partial.trim().is_empty() {
        format!("{prefix} You can retry or ask what got done.")
    } else {
        format!(
            "{prefix} Here's what came through:\n\n{}\n\nYou can retry or ask what got done.",
            truncate(partial, 500)
        )
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
