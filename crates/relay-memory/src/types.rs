use relay_core::types::{MessageRole, Visibility};
use serde::{Deserialize, Serialize};

/// A single user/assistant/system turn, persisted immutably except for the
/// one-time `summarized`/`conversation_id` flip performed by the Consolidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub channel: String,
    pub created_at: String,
    pub conversation_id: Option<String>,
    pub summarized: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub delivery_status: Option<String>,
}

/// A closed block of contiguous same-channel messages, with its model-
/// generated summary. Terminal once `ended_at` is set; never reopened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub channel: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub message_count: u32,
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Kind of a [`MemoryRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Goal,
    ActionItem,
    Summary,
    CompletedGoal,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Fact => write!(f, "fact"),
            MemoryType::Goal => write!(f, "goal"),
            MemoryType::ActionItem => write!(f, "action_item"),
            MemoryType::Summary => write!(f, "summary"),
            MemoryType::CompletedGoal => write!(f, "completed_goal"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryType::Fact),
            "goal" => Ok(MemoryType::Goal),
            "action_item" => Ok(MemoryType::ActionItem),
            "summary" => Ok(MemoryType::Summary),
            "completed_goal" => Ok(MemoryType::CompletedGoal),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// Structured `metadata` fields the Dedup Memory Store reads/writes; the
/// column itself stores arbitrary JSON but these are the keys it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_sources: Vec<String>,
    #[serde(default)]
    pub corroboration_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_corroborated_at: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<ConflictInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub new_content: String,
    pub new_source_agent: String,
    pub new_visibility: Visibility,
    pub similarity: f64,
    pub reason: String,
    pub flagged_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub source_agent: String,
    pub visibility: Visibility,
    pub deadline: Option<String>,
    pub completed_at: Option<String>,
    pub conversation_id: Option<String>,
    pub metadata: MemoryMetadata,
    pub embedding: Option<Vec<u8>>,
    pub created_at: String,
}

/// Parameters for [`crate::manager::MemoryManager::insert_with_dedup`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub content: String,
    pub source_agent: String,
    pub visibility: Visibility,
    pub deadline: Option<String>,
    pub conversation_id: Option<String>,
}

/// Outcome of a dedup insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupAction {
    Inserted,
    Merged,
    Flagged,
}

#[derive(Debug, Clone)]
pub struct DedupResult {
    pub id: String,
    pub action: DedupAction,
    pub resolution: Option<&'static str>,
}

/// A single candidate returned by similarity search, restricted to the
/// `type` of the record being inserted.
#[derive(Debug, Clone)]
pub struct SimilarMemory {
    pub id: String,
    pub content: String,
    pub source_agent: String,
    pub visibility: Visibility,
    pub similarity: f64,
}

/// Pure classification of how a near-duplicate memory should be resolved.
/// See [`crate::dedup::resolve_conflict`] — depends only on
/// `(similarity, same_agent, same_visibility, len_ratio)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Merge,
    KeepBoth,
    FlagForUser,
}
