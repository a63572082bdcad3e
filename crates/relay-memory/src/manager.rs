use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use relay_core::types::Visibility;

use crate::dedup::{resolve_conflict, text_similarity, DEDUP_THRESHOLD};
use crate::error::{MemoryError, Result};
use crate::types::{
    Conversation, DedupAction, DedupResult, MemoryMetadata, MemoryRecord, MemoryType,
    MessageRecord, NewMemory, Resolution, SimilarMemory,
};

/// Candidates considered per insert before giving up and inserting outright.
const SIMILARITY_CANDIDATE_LIMIT: usize = 25;

/// Thread-safe front door onto the `messages`, `conversations`, and `memory`
/// tables. A single connection is shared under a mutex, matching how the
/// rest of this workspace treats embedded SQLite — the database itself, not
/// in-process locking, is what needs to stay correct under concurrent
/// writers.
pub struct MemoryManager {
    db: Mutex<rusqlite::Connection>,
}

impl MemoryManager {
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    // ---- messages -------------------------------------------------------

    #[instrument(skip(self, content), fields(channel, role = %role))]
    pub fn save_message(
        &self,
        role: relay_core::types::MessageRole,
        content: &str,
        channel: &str,
        conversation_id: Option<&str>,
    ) -> Result<MessageRecord> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (id, role, content, channel, created_at, conversation_id, summarized, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, '{}')",
            params![id, role.to_string(), content, channel, now, conversation_id],
        )?;
        db.execute(
            "INSERT INTO messages_fts(rowid, content) SELECT rowid, content FROM messages WHERE id = ?1",
            params![id],
        )?;
        Ok(MessageRecord {
            id,
            role,
            content: content.to_string(),
            channel: channel.to_string(),
            created_at: now,
            conversation_id: conversation_id.map(str::to_string),
            summarized: false,
            metadata: serde_json::json!({}),
            delivery_status: None,
        })
    }

    /// Up to `limit` oldest not-yet-summarized messages on `channel`, in
    /// chronological order — the Consolidator's input batch.
    #[instrument(skip(self), fields(channel, limit))]
    pub fn unsummarized_messages(&self, channel: &str, limit: u32) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, channel, created_at, conversation_id, summarized, metadata, delivery_status
             FROM messages WHERE channel = ?1 AND summarized = 0
             ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![channel, limit], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[instrument(skip(self, ids), fields(channel = %conversation_id))]
    pub fn mark_summarized(&self, ids: &[String], conversation_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        for id in ids {
            db.execute(
                "UPDATE messages SET summarized = 1, conversation_id = ?1 WHERE id = ?2",
                params![conversation_id, id],
            )?;
        }
        Ok(())
    }

    /// Up to `limit` oldest not-yet-summarized messages across every
    /// channel, in chronological order — the Consolidator's input batch
    /// when triggered unfiltered (periodic batch schedule, admin API with
    /// no channel given).
    #[instrument(skip(self), fields(limit))]
    pub fn unsummarized_messages_any_channel(&self, limit: u32) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, channel, created_at, conversation_id, summarized, metadata, delivery_status
             FROM messages WHERE summarized = 0
             ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sets `conversation_id` on `ids` without touching `summarized` — the
    /// Consolidator's provisional block assignment, made before the model
    /// call that decides whether the block's summary extraction succeeded.
    #[instrument(skip(self, ids), fields(conversation_id))]
    pub fn assign_conversation_id(&self, ids: &[String], conversation_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        for id in ids {
            db.execute(
                "UPDATE messages SET conversation_id = ?1 WHERE id = ?2",
                params![conversation_id, id],
            )?;
        }
        Ok(())
    }

    /// Clears `conversation_id` back to `NULL` on `ids`, leaving
    /// `summarized` untouched — the Consolidator's rollback when a block's
    /// summary extraction fails.
    #[instrument(skip(self, ids))]
    pub fn clear_conversation_id(&self, ids: &[String]) -> Result<()> {
        let db = self.db.lock().unwrap();
        for id in ids {
            db.execute(
                "UPDATE messages SET conversation_id = NULL WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    /// Deletes a provisional `Conversation` row — paired with
    /// [`Self::clear_conversation_id`] in the Consolidator's rollback path.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// The most recent `limit` messages on `channel`, in chronological order
    /// — the Context Assembler's "recent messages" fragment. Unlike
    /// [`Self::unsummarized_messages`] this ignores `summarized`, since a
    /// turn's prompt wants recent history regardless of consolidation state.
    #[instrument(skip(self), fields(channel, limit))]
    pub fn recent_messages(&self, channel: &str, limit: u32) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, channel, created_at, conversation_id, summarized, metadata, delivery_status
             FROM messages WHERE channel = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![channel, limit], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Free-text search over stored memories — the Context Assembler's
    /// "semantic/full-text" fragment. Backed by the same FTS5 index
    /// [`Self::similar_memories`] narrows candidates with; ranked here by
    /// token-overlap similarity to `query` rather than restricted to one
    /// `memory_type`.
    #[instrument(skip(self, query), fields(limit))]
    pub fn search_memory(&self, query: &str, limit: u32) -> Result<Vec<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        let Some(match_query) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        let mut stmt = db.prepare(
            "SELECT m.id, m.memory_type, m.content, m.source_agent, m.visibility, m.deadline,
                    m.completed_at, m.conversation_id, m.metadata, m.embedding, m.created_at
             FROM memory m JOIN memory_fts f ON f.rowid = m.rowid
             WHERE memory_fts MATCH ?1 LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![match_query, limit], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.sort_by(|a, b| {
            text_similarity(query, &b.content)
                .partial_cmp(&text_similarity(query, &a.content))
                .unwrap()
        });
        Ok(rows)
    }

    // ---- conversations ----------------------------------------------------

    #[instrument(skip(self), fields(channel))]
    pub fn open_conversation(&self, channel: &str, started_at: &str) -> Result<Conversation> {
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (id, channel, started_at, message_count, metadata)
             VALUES (?1, ?2, ?3, 0, '{}')",
            params![id, channel, started_at],
        )?;
        Ok(Conversation {
            id,
            channel: channel.to_string(),
            started_at: started_at.to_string(),
            ended_at: None,
            message_count: 0,
            summary: None,
            metadata: serde_json::json!({}),
        })
    }

    /// Return `channel`'s currently open conversation (`ended_at IS NULL`),
    /// creating one if none exists — the Response Pipeline's per-turn
    /// attachment point, distinct from the Consolidator's own block-based
    /// `conversation_id` assignment which may later reassign these messages
    /// to a different conversation entirely.
    #[instrument(skip(self), fields(channel))]
    pub fn get_or_create_open_conversation(&self, channel: &str) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            let existing = db
                .query_row(
                    "SELECT id, channel, started_at, ended_at, message_count, summary, metadata
                     FROM conversations WHERE channel = ?1 AND ended_at IS NULL
                     ORDER BY started_at DESC LIMIT 1",
                    params![channel],
                    row_to_conversation,
                )
                .optional()?;
            if let Some(conversation) = existing {
                return Ok(conversation);
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.open_conversation(channel, &now)
    }

    #[instrument(skip(self, summary), fields(conversation_id))]
    pub fn close_conversation(
        &self,
        conversation_id: &str,
        message_count: u32,
        summary: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE conversations SET ended_at = ?1, message_count = ?2, summary = ?3 WHERE id = ?4",
            params![now, message_count, summary, conversation_id],
        )?;
        if rows == 0 {
            return Err(MemoryError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(())
    }

    /// Count of messages attributed to `conversation_id` — used to fill in
    /// `close_conversation`'s `message_count` from the caller side rather
    /// than tracking a running counter on every `save_message`.
    pub fn count_messages(&self, conversation_id: &str) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    // ---- memory / dedup ----------------------------------------------------

    /// Insert `new`, deduplicating against existing memories of the same
    /// `memory_type`. Candidates are ranked by token-overlap similarity;
    /// below [`DEDUP_THRESHOLD`] the memory is inserted outright, at or
    /// above it [`crate::dedup::resolve_conflict`] decides the outcome.
    #[instrument(skip(self, new), fields(memory_type = %new.memory_type, source_agent = %new.source_agent))]
    pub fn insert_with_dedup(&self, new: NewMemory) -> Result<DedupResult> {
        let candidates = self.similar_memories(new.memory_type, &new.content)?;
        let best = candidates
            .into_iter()
            .max_by(|a, b| a.similarity.partial_cmp(&b.similarity).unwrap());

        let best = match best {
            Some(c) if c.similarity >= DEDUP_THRESHOLD => c,
            _ => {
                let id = self.insert_memory(&new, MemoryMetadata::default())?;
                return Ok(DedupResult {
                    id,
                    action: DedupAction::Inserted,
                    resolution: None,
                });
            }
        };

        let same_agent = best.source_agent == new.source_agent;
        let same_visibility = best.visibility == new.visibility;
        let resolution = resolve_conflict(
            best.similarity,
            same_agent,
            same_visibility,
            new.content.len(),
            best.content.len(),
        );

        match resolution {
            Resolution::Merge => {
                self.merge_memory(&best.id, &new, best.similarity)?;
                Ok(DedupResult {
                    id: best.id,
                    action: DedupAction::Merged,
                    resolution: Some("merge"),
                })
            }
            Resolution::KeepBoth => {
                let id = self.insert_memory(&new, MemoryMetadata::default())?;
                Ok(DedupResult {
                    id,
                    action: DedupAction::Inserted,
                    resolution: Some("keep_both"),
                })
            }
            Resolution::FlagForUser => {
                self.flag_memory_for_review(&best.id, &new, best.similarity)?;
                Ok(DedupResult {
                    id: best.id,
                    action: DedupAction::Flagged,
                    resolution: Some("flag_for_user"),
                })
            }
        }
    }

    /// Candidates of the same type, ranked by word-overlap similarity to
    /// `content`. An FTS5 MATCH narrows the scan when `content` has terms
    /// to search on; an empty or purely-symbolic query falls back to a
    /// bounded full scan of the type so short memories still dedup.
    fn similar_memories(&self, memory_type: MemoryType, content: &str) -> Result<Vec<SimilarMemory>> {
        let db = self.db.lock().unwrap();
        let type_str = memory_type.to_string();
        let match_query = fts_match_query(content);

        let mut rows: Vec<(String, String, String, String)> = Vec::new();
        if let Some(query) = match_query {
            let mut stmt = db.prepare(
                "SELECT m.id, m.content, m.source_agent, m.visibility
                 FROM memory m JOIN memory_fts f ON f.rowid = m.rowid
                 WHERE m.memory_type = ?1 AND memory_fts MATCH ?2
                 LIMIT ?3",
            )?;
            rows = stmt
                .query_map(
                    params![type_str, query, SIMILARITY_CANDIDATE_LIMIT as i64],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }
        if rows.is_empty() {
            let mut stmt = db.prepare(
                "SELECT id, content, source_agent, visibility FROM memory
                 WHERE memory_type = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            rows = stmt
                .query_map(params![type_str, SIMILARITY_CANDIDATE_LIMIT as i64], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        Ok(rows
            .into_iter()
            .map(|(id, existing_content, source_agent, visibility)| {
                let similarity = text_similarity(content, &existing_content);
                SimilarMemory {
                    id,
                    content: existing_content,
                    source_agent,
                    visibility: visibility.parse().unwrap_or(Visibility::Private),
                    similarity,
                }
            })
            .collect())
    }

    fn insert_memory(&self, new: &NewMemory, metadata: MemoryMetadata) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memory (id, memory_type, content, source_agent, visibility, deadline, conversation_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.memory_type.to_string(),
                new.content,
                new.source_agent,
                new.visibility.to_string(),
                new.deadline,
                new.conversation_id,
                serde_json::to_string(&metadata)?,
                now,
            ],
        )?;
        db.execute(
            "INSERT INTO memory_fts(rowid, content) SELECT rowid, content FROM memory WHERE id = ?1",
            params![id],
        )?;
        Ok(id)
    }

    /// Merge a corroborating memory into `existing_id`: bump the
    /// corroboration count, record the source as an alt source, promote
    /// visibility monotonically, and overwrite content only when the new
    /// text is substantially (>1.3x) longer — never discard a longer record
    /// in favor of a shorter restatement.
    fn merge_memory(&self, existing_id: &str, new: &NewMemory, similarity: f64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let (existing_content, existing_visibility_str, metadata_json): (String, String, String) = db
            .query_row(
                "SELECT content, visibility, metadata FROM memory WHERE id = ?1",
                params![existing_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    MemoryError::NotFound(existing_id.to_string())
                }
                other => MemoryError::Database(other),
            })?;
        let existing_visibility: Visibility =
            existing_visibility_str.parse().unwrap_or(Visibility::Private);
        let promoted = existing_visibility.promote(new.visibility);

        let mut metadata: MemoryMetadata = serde_json::from_str(&metadata_json)?;
        if !metadata.alt_sources.contains(&new.source_agent) {
            metadata.alt_sources.push(new.source_agent.clone());
        }
        metadata.corroboration_count += 1;
        metadata.last_corroborated_at = Some(chrono::Utc::now().to_rfc3339());
        debug!(similarity, "merging corroborating memory");

        let upgraded = new.content.len() as f64 > existing_content.len() as f64 * 1.3;
        let content = if upgraded {
            new.content.clone()
        } else {
            existing_content
        };

        if upgraded {
            // Content changed — clear the embedding so it regenerates.
            db.execute(
                "UPDATE memory SET content = ?1, visibility = ?2, metadata = ?3, embedding = NULL WHERE id = ?4",
                params![
                    content,
                    promoted.to_string(),
                    serde_json::to_string(&metadata)?,
                    existing_id,
                ],
            )?;
        } else {
            db.execute(
                "UPDATE memory SET content = ?1, visibility = ?2, metadata = ?3 WHERE id = ?4",
                params![
                    content,
                    promoted.to_string(),
                    serde_json::to_string(&metadata)?,
                    existing_id,
                ],
            )?;
        }
        db.execute(
            "INSERT INTO memory_fts(memory_fts, rowid, content) VALUES('delete', (SELECT rowid FROM memory WHERE id = ?1), '')",
            params![existing_id],
        ).ok();
        db.execute(
            "INSERT INTO memory_fts(rowid, content) SELECT rowid, content FROM memory WHERE id = ?1",
            params![existing_id],
        )?;
        Ok(())
    }

    fn flag_memory_for_review(&self, existing_id: &str, new: &NewMemory, similarity: f64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let metadata_json: String = db
            .query_row(
                "SELECT metadata FROM memory WHERE id = ?1",
                params![existing_id],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    MemoryError::NotFound(existing_id.to_string())
                }
                other => MemoryError::Database(other),
            })?;
        let mut metadata: MemoryMetadata = serde_json::from_str(&metadata_json)?;
        metadata.needs_review = true;
        metadata.conflict_info = Some(crate::types::ConflictInfo {
            new_content: new.content.clone(),
            new_source_agent: new.source_agent.clone(),
            new_visibility: new.visibility,
            similarity,
            reason: "length mismatch between corroborating statements".to_string(),
            flagged_at: chrono::Utc::now().to_rfc3339(),
        });
        warn!(existing_id, similarity, "flagged conflicting memory for user review");
        db.execute(
            "UPDATE memory SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, existing_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(id))]
    pub fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, memory_type, content, source_agent, visibility, deadline, completed_at,
                    conversation_id, metadata, embedding, created_at
             FROM memory WHERE id = ?1",
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(MemoryError::Database)
    }

    /// Memories of `memory_type`, newest first — the shape the Context
    /// Assembler fetches per fan-out slot for a turn.
    #[instrument(skip(self), fields(memory_type = %memory_type, limit))]
    pub fn list_by_type(&self, memory_type: MemoryType, limit: u32) -> Result<Vec<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, memory_type, content, source_agent, visibility, deadline, completed_at,
                    conversation_id, metadata, embedding, created_at
             FROM memory WHERE memory_type = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![memory_type.to_string(), limit], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Find the active (not yet completed) goal whose content best matches
    /// `search`, preferring `preferred_agent` among ties and otherwise
    /// breaking ties newest-first. Used to resolve `[DONE: search text]`
    /// tags, which name a goal by its content rather than its id.
    #[instrument(skip(self, search), fields(preferred_agent))]
    pub fn find_active_goal(
        &self,
        search: &str,
        preferred_agent: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, memory_type, content, source_agent, visibility, deadline, completed_at,
                    conversation_id, metadata, embedding, created_at
             FROM memory WHERE memory_type = 'goal' ORDER BY created_at DESC",
        )?;
        let goals = stmt
            .query_map([], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(db);

        let mut scored: Vec<(f64, MemoryRecord)> = goals
            .into_iter()
            .map(|g| (text_similarity(search, &g.content), g))
            .filter(|(score, _)| *score > 0.0)
            .collect();

        if scored.is_empty() {
            return Ok(None);
        }

        // Stable sort by score descending; within equal scores the input
        // order (newest-first from the query) is preserved, so the
        // preferred-agent pass below only needs to look at the top score.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        let top_score = scored[0].0;
        if let Some(agent) = preferred_agent {
            if let Some((_, goal)) = scored
                .iter()
                .find(|(score, g)| *score == top_score && g.source_agent == agent)
            {
                return Ok(Some(goal.clone()));
            }
        }
        Ok(Some(scored.into_iter().next().unwrap().1))
    }

    #[instrument(skip(self), fields(id))]
    pub fn complete_goal(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE memory SET memory_type = 'completed_goal', completed_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if rows == 0 {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Strip FTS5 operator characters and keep only word tokens, OR-joined so a
/// partial match still surfaces a candidate; `None` when nothing is left to
/// search on.
fn fts_match_query(content: &str) -> Option<String> {
    let terms: Vec<String> = content
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let metadata_str: String = row.get(6)?;
    Ok(Conversation {
        id: row.get(0)?,
        channel: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        message_count: row.get::<_, i64>(4)? as u32,
        summary: row.get(5)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(1)?;
    let role = role_str.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "role".to_string(), rusqlite::types::Type::Text)
    })?;
    let metadata_str: String = row.get(7)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        role,
        content: row.get(2)?,
        channel: row.get(3)?,
        created_at: row.get(4)?,
        conversation_id: row.get(5)?,
        summarized: row.get::<_, i64>(6)? != 0,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
        delivery_status: row.get(8)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let type_str: String = row.get(1)?;
    let memory_type = type_str.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "memory_type".to_string(), rusqlite::types::Type::Text)
    })?;
    let visibility_str: String = row.get(4)?;
    let visibility = visibility_str.parse().unwrap_or(Visibility::Private);
    let metadata_str: String = row.get(8)?;
    let metadata = serde_json::from_str(&metadata_str).unwrap_or_default();
    Ok(MemoryRecord {
        id: row.get(0)?,
        memory_type,
        content: row.get(2)?,
        source_agent: row.get(3)?,
        visibility,
        deadline: row.get(5)?,
        completed_at: row.get(6)?,
        conversation_id: row.get(7)?,
        metadata,
        embedding: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::MessageRole;

    fn manager() -> MemoryManager {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        MemoryManager::new(conn)
    }

    fn memory(content: &str, agent: &str) -> NewMemory {
        NewMemory {
            memory_type: MemoryType::Fact,
            content: content.to_string(),
            source_agent: agent.to_string(),
            visibility: Visibility::Shared,
            deadline: None,
            conversation_id: None,
        }
    }

    #[test]
    fn unrelated_memory_is_inserted() {
        let mgr = manager();
        let result = mgr.insert_with_dedup(memory("likes coffee in the morning", "general")).unwrap();
        assert_eq!(result.action, DedupAction::Inserted);
    }

    #[test]
    fn near_identical_memory_from_same_agent_merges() {
        let mgr = manager();
        let first = mgr
            .insert_with_dedup(memory("prefers dark roast coffee every morning", "general"))
            .unwrap();
        let second = mgr
            .insert_with_dedup(memory("prefers dark roast coffee every single morning", "general"))
            .unwrap();
        assert_eq!(second.action, DedupAction::Merged);
        assert_eq!(first.id, second.id);

        let stored = mgr.get_memory(&first.id).unwrap().unwrap();
        assert_eq!(stored.metadata.corroboration_count, 1);
    }

    #[test]
    fn conflicting_visibility_keeps_both_copies() {
        let mgr = manager();
        let first = mgr
            .insert_with_dedup(memory("works remotely on tuesdays and thursdays", "general"))
            .unwrap();
        let mut other = memory("works remotely on tuesdays and thursdays", "research");
        other.visibility = Visibility::Private;
        let second = mgr.insert_with_dedup(other).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.action, DedupAction::Inserted);
    }

    #[test]
    fn unsummarized_messages_return_in_chronological_order() {
        let mgr = manager();
        mgr.save_message(MessageRole::User, "hello", "tg", None).unwrap();
        mgr.save_message(MessageRole::Assistant, "hi there", "tg", None).unwrap();
        let batch = mgr.unsummarized_messages("tg", 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].content, "hello");
    }

    #[test]
    fn find_active_goal_prefers_newest_among_equal_matches() {
        let mgr = manager();
        let goal = |content: &str, agent: &str| NewMemory {
            memory_type: MemoryType::Goal,
            content: content.to_string(),
            source_agent: agent.to_string(),
            visibility: Visibility::Shared,
            deadline: None,
            conversation_id: None,
        };
        let older = mgr.insert_with_dedup(goal("finish the quarterly report", "general")).unwrap();
        // A different-visibility memory won't merge, so this inserts a second
        // distinct "quarterly report" goal that is newer than `older`.
        let mut newer_goal = goal("finish the quarterly report", "general");
        newer_goal.visibility = Visibility::Private;
        let newer = mgr.insert_with_dedup(newer_goal).unwrap();
        assert_ne!(older.id, newer.id);

        let found = mgr.find_active_goal("quarterly report", None).unwrap().unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[test]
    fn find_active_goal_returns_none_when_nothing_matches() {
        let mgr = manager();
        mgr.insert_with_dedup(NewMemory {
            memory_type: MemoryType::Goal,
            content: "book a dentist appointment".to_string(),
            source_agent: "general".to_string(),
            visibility: Visibility::Shared,
            deadline: None,
            conversation_id: None,
        })
        .unwrap();
        assert!(mgr.find_active_goal("unrelated search text", None).unwrap().is_none());
    }

    #[test]
    fn get_or_create_open_conversation_is_idempotent_until_closed() {
        let mgr = manager();
        let first = mgr.get_or_create_open_conversation("tg").unwrap();
        let second = mgr.get_or_create_open_conversation("tg").unwrap();
        assert_eq!(first.id, second.id);

        mgr.close_conversation(&first.id, 2, "summary").unwrap();
        let third = mgr.get_or_create_open_conversation("tg").unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn closing_conversation_requires_it_to_exist() {
        let mgr = manager();
        let err = mgr.close_conversation("missing", 0, "summary").unwrap_err();
        assert!(matches!(err, MemoryError::ConversationNotFound(_)));
    }
}
