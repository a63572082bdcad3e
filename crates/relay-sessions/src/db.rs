use rusqlite::Connection;

use crate::error::Result;

/// Initialise the `agent_sessions` table and its indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_sessions (
            id            TEXT PRIMARY KEY,
            channel       TEXT NOT NULL,
            agent         TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            state         TEXT NOT NULL
        );
        -- enforces 'exactly one active AgentSession per channel at a time'
        CREATE UNIQUE INDEX IF NOT EXISTS idx_agent_sessions_one_active
            ON agent_sessions(channel) WHERE state = 'active';
        CREATE INDEX IF NOT EXISTS idx_agent_sessions_channel_activity
            ON agent_sessions(channel, last_activity DESC);",
    )?;
    Ok(())
}
