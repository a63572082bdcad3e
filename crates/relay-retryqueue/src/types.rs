use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Processing => "processing",
            RetryStatus::Completed => "completed",
            RetryStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RetryStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RetryStatus::Pending),
            "processing" => Ok(RetryStatus::Processing),
            "completed" => Ok(RetryStatus::Completed),
            "failed" => Ok(RetryStatus::Failed),
            other => Err(format!("unknown retry status: {other}")),
        }
    }
}

/// A durable unit of best-effort synchronisation work, e.g. pushing a state
/// change to an external project tracker. `target_id` may be late-bound
/// (resolved on first processing attempt and cached back onto the row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: String,
    pub action: String,
    pub target_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: RetryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: String,
    pub created_at: String,
}

/// Parameters accepted by [`crate::engine::RetryQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct NewRetryItem {
    pub action: String,
    pub target_id: Option<String>,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl Default for NewRetryItem {
    fn default() -> Self {
        Self {
            action: String::new(),
            target_id: None,
            payload: serde_json::json!({}),
            max_attempts: 5,
        }
    }
}

/// Outcome an action executor reports back to the queue for one attempt.
pub enum AttemptOutcome {
    Success,
    Failure(String),
    /// The target id was resolved during this attempt and should be cached
    /// onto the row for subsequent retries.
    ResolvedThenFailure {
        resolved_target_id: String,
        error: String,
    },
}
