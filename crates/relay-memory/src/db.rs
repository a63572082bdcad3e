use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_messages_table(conn)?;
    create_messages_fts(conn)?;
    create_conversations_table(conn)?;
    create_memory_table(conn)?;
    create_memory_fts(conn)?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            channel         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            conversation_id TEXT,
            summarized      INTEGER NOT NULL DEFAULT 0,
            metadata        TEXT NOT NULL DEFAULT '{}',
            delivery_status TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_unsummarized
            ON messages(channel, created_at) WHERE summarized = 0;
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id);",
    )
}

/// FTS5 virtual table mirroring `messages.content`, synced manually on write.
fn create_messages_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
            USING fts5(content, content='messages', content_rowid='rowid');",
    )
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id           TEXT PRIMARY KEY,
            channel      TEXT NOT NULL,
            started_at   TEXT NOT NULL,
            ended_at     TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            summary      TEXT,
            metadata     TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_channel
            ON conversations(channel, started_at DESC);",
    )
}

fn create_memory_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory (
            id              TEXT PRIMARY KEY,
            memory_type     TEXT NOT NULL,
            content         TEXT NOT NULL,
            source_agent    TEXT NOT NULL,
            visibility      TEXT NOT NULL,
            deadline        TEXT,
            completed_at    TEXT,
            conversation_id TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            embedding       BLOB,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memory_type
            ON memory(memory_type);
        CREATE INDEX IF NOT EXISTS idx_memory_open_goals
            ON memory(memory_type, completed_at) WHERE memory_type = 'goal';",
    )
}

/// FTS5 index over memory content, scoped at query time to candidates of the
/// same `memory_type` — the dedup search never compares across types.
fn create_memory_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
            USING fts5(content, content='memory', content_rowid='rowid');",
    )
}
