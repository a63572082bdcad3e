use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::types::{AgentSession, AgentSessionState};

/// Idle-expiry window for an `active` `AgentSession` (§3: "idle-expired after 2h").
pub const SESSION_IDLE_EXPIRY_SECS: i64 = 2 * 60 * 60;

/// Thread-safe manager for `AgentSession` rows.
///
/// Enforces the invariant "exactly one `AgentSession` in state `active` per
/// channel at a time" — the unique partial index in [`crate::db::init_db`]
/// backs it at the storage layer; this manager never bypasses it.
pub struct SessionManager {
    db: Mutex<Connection>,
}

impl SessionManager {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Return the channel's active session, creating one attributed to
    /// `agent` if none exists yet.
    #[instrument(skip(self), fields(channel, agent))]
    pub fn get_or_create_active(&self, channel: &str, agent: &str) -> Result<AgentSession> {
        if let Some(session) = self.get_active(channel)? {
            debug!("active agent session already exists");
            return Ok(session);
        }

        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO agent_sessions
             (id, channel, agent, created_at, last_activity, state)
             VALUES (?1, ?2, ?3, ?4, ?4, 'active')",
            rusqlite::params![id, channel, agent, now],
        )?;

        let session = db.query_row(
            "SELECT id, channel, agent, created_at, last_activity, state
             FROM agent_sessions WHERE channel = ?1 AND state = 'active'",
            rusqlite::params![channel],
            row_to_session,
        )?;
        Ok(session)
    }

    /// Return the channel's currently active session, if any.
    #[instrument(skip(self), fields(channel))]
    pub fn get_active(&self, channel: &str) -> Result<Option<AgentSession>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, channel, agent, created_at, last_activity, state
             FROM agent_sessions WHERE channel = ?1 AND state = 'active'",
            rusqlite::params![channel],
            row_to_session,
        )
        .optional()
        .map_err(SessionError::Database)
    }

    /// Bump `last_activity` to now for the channel's active session.
    #[instrument(skip(self), fields(channel))]
    pub fn touch(&self, channel: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE agent_sessions SET last_activity = ?1 WHERE channel = ?2 AND state = 'active'",
            rusqlite::params![now, channel],
        )?;
        Ok(())
    }

    /// Transition the channel's active session to `completed`.
    #[instrument(skip(self), fields(channel))]
    pub fn complete_active(&self, channel: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE agent_sessions SET state = 'completed' WHERE channel = ?1 AND state = 'active'",
            rusqlite::params![channel],
        )?;
        if rows == 0 {
            return Err(SessionError::NotFound {
                channel: channel.to_string(),
            });
        }
        Ok(())
    }

    /// Sweep all channels' active sessions, expiring any idle longer than
    /// [`SESSION_IDLE_EXPIRY_SECS`]. Returns the number of sessions expired.
    #[instrument(skip(self))]
    pub fn expire_idle(&self) -> Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(SESSION_IDLE_EXPIRY_SECS))
            .to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE agent_sessions SET state = 'expired'
             WHERE state = 'active' AND last_activity < ?1",
            rusqlite::params![cutoff],
        )?;
        if changed > 0 {
            warn!(count = changed, "expired idle agent sessions");
        }
        Ok(changed as u64)
    }

    /// Find the most-recently-active session on `channel` covering `at`
    /// (created at or before `at`). Used by the Consolidator to attribute a
    /// block of messages to an agent; callers fall back to `"general"` when
    /// this returns `None`.
    #[instrument(skip(self), fields(channel, at))]
    pub fn most_recently_active_covering(
        &self,
        channel: &str,
        at: &str,
    ) -> Result<Option<AgentSession>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, channel, agent, created_at, last_activity, state
             FROM agent_sessions
             WHERE channel = ?1 AND created_at <= ?2
             ORDER BY created_at DESC
             LIMIT 1",
            rusqlite::params![channel, at],
            row_to_session,
        )
        .optional()
        .map_err(SessionError::Database)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentSession> {
    let state_str: String = row.get(5)?;
    let state: AgentSessionState = state_str.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(5, "state".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(AgentSession {
        id: row.get(0)?,
        channel: row.get(1)?,
        agent: row.get(2)?,
        created_at: row.get(3)?,
        last_activity: row.get(4)?,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        SessionManager::new(conn)
    }

    #[test]
    fn get_or_create_is_idempotent_per_channel() {
        let mgr = manager();
        let a = mgr.get_or_create_active("tg", "general").unwrap();
        let b = mgr.get_or_create_active("tg", "research").unwrap();
        assert_eq!(a.id, b.id, "second call must return the same active session");
    }

    #[test]
    fn complete_then_create_starts_a_new_session() {
        let mgr = manager();
        let a = mgr.get_or_create_active("tg", "general").unwrap();
        mgr.complete_active("tg").unwrap();
        let b = mgr.get_or_create_active("tg", "general").unwrap();
        assert_ne!(a.id, b.id);
    }
}
