use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use relay_core::config::ConsolidatorConfig;
use relay_core::types::{MessageRole, Visibility};
use relay_memory::manager::MemoryManager;
use relay_memory::types::{MemoryRecord, MemoryType, MessageRecord, NewMemory};
use relay_model::{InvokeOptions, ModelGateway};
use relay_sessions::SessionManager;

use crate::error::Result;

/// Strict shape the summarization prompt is instructed to emit. Any other
/// shape, or invalid JSON, fails extraction for that block.
#[derive(Debug, Deserialize)]
struct ExtractedSummary {
    summary: String,
    #[serde(default)]
    memories: Vec<ExtractedMemory>,
}

#[derive(Debug, Deserialize)]
struct ExtractedMemory {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

/// Outcome of one [`Consolidator::run_once`] pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsolidationReport {
    pub blocks_seen: usize,
    pub blocks_summarized: usize,
    pub blocks_rolled_back: usize,
    pub memories_written: usize,
}

/// Groups unsummarized messages into blocks, summarizes each with a model
/// call, and extracts facts/action-items into the Dedup Memory Store (§4.I).
///
/// Triggered by a channel's idle timer, a voice/call socket closing with
/// non-empty history, the periodic batch schedule driven by
/// [`Consolidator::run_periodic`], or an admin API call — all of which just
/// call [`Consolidator::run_once`] with an optional channel filter.
pub struct Consolidator {
    memory: Arc<MemoryManager>,
    sessions: Arc<SessionManager>,
    model: Arc<ModelGateway>,
    config: ConsolidatorConfig,
    on_invalidate: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Consolidator {
    pub fn new(
        memory: Arc<MemoryManager>,
        sessions: Arc<SessionManager>,
        model: Arc<ModelGateway>,
        config: ConsolidatorConfig,
        on_invalidate: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Self {
        Self {
            memory,
            sessions,
            model,
            config,
            on_invalidate,
        }
    }

    /// Runs the periodic batch schedule (≈ every `batch_interval_ms`) until
    /// `cancel` fires, consolidating across every channel each tick.
    pub async fn run_periodic(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.batch_interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.run_once(None).await {
                        Ok(report) => info!(
                            blocks_summarized = report.blocks_summarized,
                            blocks_rolled_back = report.blocks_rolled_back,
                            "periodic consolidation pass complete"
                        ),
                        Err(e) => warn!(error = %e, "periodic consolidation pass failed"),
                    }
                }
            }
        }
    }

    /// One consolidation pass. `channel`, if given, restricts the input
    /// batch to that channel; otherwise every channel's unsummarized
    /// messages are fetched together and grouped as usual (a channel change
    /// always starts a new block, so cross-channel batches never merge).
    #[instrument(skip(self), fields(channel = channel.unwrap_or("*")))]
    pub async fn run_once(&self, channel: Option<&str>) -> Result<ConsolidationReport> {
        let messages = match channel {
            Some(channel) => self
                .memory
                .unsummarized_messages(channel, self.config.batch_size)?,
            None => self
                .memory
                .unsummarized_messages_any_channel(self.config.batch_size)?,
        };

        let mut report = ConsolidationReport::default();
        for block in group_into_blocks(messages, self.config.block_gap_ms) {
            report.blocks_seen += 1;
            match self.consolidate_block(&block).await {
                Ok(written) => {
                    report.blocks_summarized += 1;
                    report.memories_written += written;
                    (self.on_invalidate)(&block[0].channel);
                }
                Err(e) => {
                    warn!(error = %e, channel = %block[0].channel, "block summarization failed, rolled back");
                    report.blocks_rolled_back += 1;
                }
            }
        }
        Ok(report)
    }

    async fn consolidate_block(&self, block: &[MessageRecord]) -> Result<usize> {
        let channel = &block[0].channel;
        let started_at = &block[0].created_at;
        let ids: Vec<String> = block.iter().map(|m| m.id.clone()).collect();

        let conversation = self.memory.open_conversation(channel, started_at)?;
        self.memory.assign_conversation_id(&ids, &conversation.id)?;

        let extracted = match self.extract_summary(block).await {
            Some(extracted) => extracted,
            None => {
                self.memory.clear_conversation_id(&ids)?;
                self.memory.delete_conversation(&conversation.id)?;
                return Ok(0);
            }
        };

        self.memory.mark_summarized(&ids, &conversation.id)?;
        self.memory
            .close_conversation(&conversation.id, block.len() as u32, &extracted.summary)?;

        let agent = self
            .sessions
            .most_recently_active_covering(channel, started_at)?
            .map(|s| s.agent)
            .unwrap_or_else(|| "general".to_string());

        let mut written = 0;
        for memory in &extracted.memories {
            let Ok(memory_type) = parse_extractable_type(&memory.kind) else {
                continue;
            };
            self.memory.insert_with_dedup(NewMemory {
                memory_type,
                content: memory.content.clone(),
                source_agent: agent.clone(),
                visibility: Visibility::Private,
                deadline: None,
                conversation_id: Some(conversation.id.clone()),
            })?;
            written += 1;
        }

        self.memory.insert_with_dedup(NewMemory {
            memory_type: MemoryType::Summary,
            content: extracted.summary.clone(),
            source_agent: agent,
            visibility: Visibility::Private,
            deadline: None,
            conversation_id: Some(conversation.id.clone()),
        })?;
        written += 1;

        Ok(written)
    }

    /// Calls the model with a strict-JSON extraction prompt; returns `None`
    /// on model failure or invalid JSON rather than propagating, so the
    /// caller can roll the block back and defer the retry to the next run.
    async fn extract_summary(&self, block: &[MessageRecord]) -> Option<ExtractedSummary> {
        let transcript = render_transcript(block);
        let prompt = format!(
            "Summarize the following conversation transcript. Respond with ONLY a JSON \
             object of the exact shape {{\"summary\": string, \"memories\": [{{\"type\": \
             \"fact\"|\"action_item\", \"content\": string}}]}} — no markdown fences, no \
             prose before or after the JSON.\n\nTranscript:\n{transcript}"
        );

        let raw = match self
            .model
            .invoke(
                &prompt,
                InvokeOptions {
                    resume_session: false,
                    allowed_tools: Vec::new(),
                    model: None,
                    timeout: Duration::from_secs(60),
                    session_override: None,
                },
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "consolidator model call failed");
                return None;
            }
        };

        match serde_json::from_str::<ExtractedSummary>(extract_json_object(&raw)) {
            Ok(extracted) => Some(extracted),
            Err(e) => {
                warn!(error = %e, "consolidator model output was not valid JSON");
                None
            }
        }
    }
}

fn parse_extractable_type(kind: &str) -> std::result::Result<MemoryType, ()> {
    match kind {
        "fact" => Ok(MemoryType::Fact),
        "action_item" => Ok(MemoryType::ActionItem),
        _ => Err(()),
    }
}

fn render_transcript(block: &[MessageRecord]) -> String {
    block
        .iter()
        .map(|m| format!("{}: {}", role_label(m.role), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "User",
        MessageRole::Assistant => "Assistant",
        MessageRole::System => "System",
    }
}

/// Narrows `text` to its outermost `{...}` span, tolerating surrounding
/// prose or a markdown code fence the model ignored the prompt about.
fn extract_json_object(text: &str) -> &str {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if end >= start => &text[start..=end],
        _ => text,
    }
}

/// New block when the channel changes or the gap since the previous
/// message exceeds `gap_ms`. Messages are assumed already in chronological
/// order (the source query guarantees it); a parse failure on `created_at`
/// conservatively starts a new block rather than risk merging unrelated
/// conversation.
fn group_into_blocks(messages: Vec<MessageRecord>, gap_ms: u64) -> Vec<Vec<MessageRecord>> {
    let mut blocks: Vec<Vec<MessageRecord>> = Vec::new();
    let gap = chrono::Duration::milliseconds(gap_ms as i64);

    for message in messages {
        let starts_new_block = match blocks.last() {
            None => true,
            Some(block) => {
                let prev = block.last().expect("blocks are never empty");
                prev.channel != message.channel || exceeds_gap(prev, &message, gap)
            }
        };
        if starts_new_block {
            blocks.push(vec![message]);
        } else {
            blocks.last_mut().unwrap().push(message);
        }
    }
    blocks
}

fn exceeds_gap(prev: &MessageRecord, next: &MessageRecord, gap: chrono::Duration) -> bool {
    match (
        parse_timestamp(&prev.created_at),
        parse_timestamp(&next.created_at),
    ) {
        (Some(prev_at), Some(next_at)) => next_at - prev_at > gap,
        _ => true,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, created_at: &str) -> MessageRecord {
        MessageRecord {
            id: uuid::Uuid::now_v7().to_string(),
            role: MessageRole::User,
            content: "hi".to_string(),
            channel: channel.to_string(),
            created_at: created_at.to_string(),
            conversation_id: None,
            summarized: false,
            metadata: serde_json::json!({}),
            delivery_status: None,
        }
    }

    #[test]
    fn channel_change_starts_a_new_block() {
        let messages = vec![
            message("tg", "2026-07-28T00:00:00Z"),
            message("discord", "2026-07-28T00:00:01Z"),
        ];
        let blocks = group_into_blocks(messages, 30 * 60 * 1000);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn gap_over_threshold_starts_a_new_block() {
        let messages = vec![
            message("tg", "2026-07-28T00:00:00Z"),
            message("tg", "2026-07-28T01:00:00Z"),
        ];
        let blocks = group_into_blocks(messages, 30 * 60 * 1000);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn contiguous_messages_within_gap_stay_in_one_block() {
        let messages = vec![
            message("tg", "2026-07-28T00:00:00Z"),
            message("tg", "2026-07-28T00:05:00Z"),
            message("tg", "2026-07-28T00:10:00Z"),
        ];
        let blocks = group_into_blocks(messages, 30 * 60 * 1000);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 3);
    }

    #[test]
    fn extracts_json_object_from_surrounding_prose() {
        let text = "Sure, here you go:\n```json\n{\"summary\": \"hi\", \"memories\": []}\n```\nhope that helps";
        let extracted: ExtractedSummary =
            serde_json::from_str(extract_json_object(text)).unwrap();
        assert_eq!(extracted.summary, "hi");
    }

    #[test]
    fn parse_extractable_type_rejects_non_extractable_kinds() {
        assert!(parse_extractable_type("fact").is_ok());
        assert!(parse_extractable_type("action_item").is_ok());
        assert!(parse_extractable_type("goal").is_err());
        assert!(parse_extractable_type("summary").is_err());
    }
}
