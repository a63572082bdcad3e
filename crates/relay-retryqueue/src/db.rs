use rusqlite::Connection;

use crate::error::Result;

/// Initialise the retry queue schema in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS retry_queue (
            id             TEXT NOT NULL PRIMARY KEY,
            action         TEXT NOT NULL,
            target_id      TEXT,
            payload        TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'pending',
            attempts       INTEGER NOT NULL DEFAULT 0,
            max_attempts   INTEGER NOT NULL DEFAULT 5,
            last_error     TEXT,
            next_retry_at  TEXT NOT NULL,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_retry_queue_claim
            ON retry_queue(status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_retry_queue_purge
            ON retry_queue(status, created_at);",
    )?;
    Ok(())
}
