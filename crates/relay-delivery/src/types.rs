use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Fallback,
    Failed,
}

/// Options accepted by [`crate::engine::DeliveryEngine::deliver`].
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub fallback_channel: Option<String>,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            fallback_channel: None,
            max_retries: 3,
            retry_base_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub channel: String,
    pub external_id: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// A successfully-delivered message the nudge checker watches for a
/// follow-up reply from the user on the same channel.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub channel: String,
    pub sent_at: std::time::Instant,
    pub nudged: bool,
}
