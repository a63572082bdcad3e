use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backoff::backoff_secs;
use crate::db::init_db;
use crate::error::{Result, RetryQueueError};
use crate::types::{AttemptOutcome, NewRetryItem, RetryQueueItem, RetryStatus};

/// Narrow interface a caller implements to actually perform one queued
/// action. Kept separate from any concrete project-tracker client so the
/// queue never depends on a specific downstream integration (§9: "Retry
/// Queue depends on a narrow `ProjectTrackerClient` interface it receives").
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Attempt the action described by `item`, returning how the attempt
    /// went. Implementations that need to resolve a late-bound target id
    /// (e.g. looking up an external ticket id for the first time) should
    /// return [`AttemptOutcome::ResolvedThenFailure`] on the attempt where
    /// resolution happens but execution still fails, so the id is cached
    /// even on a failed attempt.
    async fn attempt(&self, item: &RetryQueueItem) -> AttemptOutcome;
}

/// Durable FIFO queue over the `plane_sync_queue` table.
pub struct RetryQueue {
    conn: Mutex<Connection>,
}

impl RetryQueue {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Enqueue a new item. Fire-and-forget by contract (§4.J): callers never
    /// see this fail in a way that should abort the triggering operation, so
    /// this still returns a `Result` for logging but callers are expected to
    /// `.ok()` it at the call site rather than propagate.
    #[instrument(skip(self, item), fields(action = %item.action))]
    pub fn enqueue(&self, item: NewRetryItem) -> Result<RetryQueueItem> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO retry_queue
             (id, action, target_id, payload, status, attempts, max_attempts, last_error, next_retry_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, NULL, ?6, ?6)",
            params![
                id,
                item.action,
                item.target_id,
                item.payload.to_string(),
                item.max_attempts,
                now,
            ],
        )?;
        info!(id = %id, "enqueued retry item");
        Ok(RetryQueueItem {
            id,
            action: item.action,
            target_id: item.target_id,
            payload: item.payload,
            status: RetryStatus::Pending,
            attempts: 0,
            max_attempts: item.max_attempts,
            last_error: None,
            next_retry_at: now.clone(),
            created_at: now,
        })
    }

    /// Claim up to `batch_size` due rows, transitioning them to `processing`
    /// inside a single `BEGIN IMMEDIATE` transaction so two concurrent
    /// workers never claim the same row — the SQLite analogue of
    /// `FOR UPDATE SKIP LOCKED`.
    #[instrument(skip(self))]
    fn claim_batch(&self, batch_size: u32) -> Result<Vec<RetryQueueItem>> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM retry_queue
                 WHERE status IN ('pending', 'processing') AND next_retry_at <= ?1
                 ORDER BY next_retry_at ASC LIMIT ?2",
            )?;
            stmt.query_map(params![now, batch_size], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE retry_queue SET status = 'processing' WHERE id = ?1",
                params![id],
            )?;
            let row = tx.query_row(
                "SELECT id, action, target_id, payload, status, attempts, max_attempts,
                        last_error, next_retry_at, created_at
                 FROM retry_queue WHERE id = ?1",
                params![id],
                row_to_item,
            )?;
            claimed.push(row);
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Record a successful attempt.
    fn record_success(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE retry_queue SET status = 'completed', last_error = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record a failed attempt: bump `attempts`, dead-letter if exhausted,
    /// otherwise reschedule with exponential backoff. `resolved_target_id`,
    /// when present, is cached onto the row regardless of outcome.
    fn record_failure(
        &self,
        item: &RetryQueueItem,
        error: &str,
        resolved_target_id: Option<&str>,
    ) -> Result<()> {
        let attempts = item.attempts + 1;
        let conn = self.conn.lock().unwrap();
        if let Some(target_id) = resolved_target_id {
            conn.execute(
                "UPDATE retry_queue SET target_id = ?1 WHERE id = ?2",
                params![target_id, item.id],
            )?;
        }
        if attempts >= item.max_attempts {
            warn!(id = %item.id, attempts, "retry item exhausted attempts, dead-lettering");
            conn.execute(
                "UPDATE retry_queue SET status = 'failed', attempts = ?1, last_error = ?2 WHERE id = ?3",
                params![attempts, error, item.id],
            )?;
        } else {
            let delay = backoff_secs(attempts);
            let next = (Utc::now() + chrono::Duration::seconds(delay as i64)).to_rfc3339();
            conn.execute(
                "UPDATE retry_queue SET status = 'pending', attempts = ?1, last_error = ?2, next_retry_at = ?3 WHERE id = ?4",
                params![attempts, error, next, item.id],
            )?;
        }
        Ok(())
    }

    /// Process one poll cycle: claim a batch, attempt each via `executor`,
    /// and persist the outcome. Returns the number of items processed.
    pub async fn run_once(&self, executor: &dyn ActionExecutor, batch_size: u32) -> Result<usize> {
        let batch = self.claim_batch(batch_size)?;
        let n = batch.len();
        for item in batch {
            match executor.attempt(&item).await {
                AttemptOutcome::Success => {
                    self.record_success(&item.id)?;
                }
                AttemptOutcome::Failure(err) => {
                    self.record_failure(&item, &err, None)?;
                }
                AttemptOutcome::ResolvedThenFailure {
                    resolved_target_id,
                    error,
                } => {
                    self.record_failure(&item, &error, Some(&resolved_target_id))?;
                }
            }
        }
        Ok(n)
    }

    /// Delete completed rows older than `max_age_days`.
    #[instrument(skip(self))]
    pub fn purge_completed(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(max_age_days as i64)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM retry_queue WHERE status = 'completed' AND created_at < ?1",
            params![cutoff],
        )?;
        if n > 0 {
            info!(count = n, "purged completed retry items");
        }
        Ok(n)
    }

    pub fn get(&self, id: &str) -> Result<RetryQueueItem> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, action, target_id, payload, status, attempts, max_attempts,
                    last_error, next_retry_at, created_at
             FROM retry_queue WHERE id = ?1",
            params![id],
            row_to_item,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => RetryQueueError::NotFound { id: id.to_string() },
            other => RetryQueueError::Database(other),
        })
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetryQueueItem> {
    let status_str: String = row.get(4)?;
    let status = status_str.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
    })?;
    let payload_str: String = row.get(3)?;
    Ok(RetryQueueItem {
        id: row.get(0)?,
        action: row.get(1)?,
        target_id: row.get(2)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({})),
        status,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_retry_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Drive [`RetryQueue::run_once`] on `poll_interval` until cancelled.
pub async fn run_worker_loop(
    queue: Arc<RetryQueue>,
    executor: Arc<dyn ActionExecutor>,
    poll_interval: Duration,
    batch_size: u32,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.run_once(executor.as_ref(), batch_size).await {
                    warn!(error = %e, "retry queue poll failed");
                }
            }
        }
    }
}

/// Drive [`RetryQueue::purge_completed`] once a day until cancelled.
pub async fn run_purge_loop(
    queue: Arc<RetryQueue>,
    max_age_days: u32,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = queue.purge_completed(max_age_days) {
                    warn!(error = %e, "retry queue purge failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn queue() -> RetryQueue {
        let conn = Connection::open_in_memory().unwrap();
        RetryQueue::new(conn).unwrap()
    }

    struct AlwaysFails;
    #[async_trait]
    impl ActionExecutor for AlwaysFails {
        async fn attempt(&self, _item: &RetryQueueItem) -> AttemptOutcome {
            AttemptOutcome::Failure("simulated".to_string())
        }
    }

    struct FailsNTimes {
        remaining: AtomicU32,
    }
    #[async_trait]
    impl ActionExecutor for FailsNTimes {
        async fn attempt(&self, _item: &RetryQueueItem) -> AttemptOutcome {
            let prev = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == 0 {
                    None
                } else {
                    Some(v - 1)
                }
            });
            if prev.is_ok() {
                AttemptOutcome::Failure("simulated".to_string())
            } else {
                AttemptOutcome::Success
            }
        }
    }

    #[tokio::test]
    async fn backoff_deltas_double_each_attempt() {
        let q = queue();
        q.enqueue(NewRetryItem {
            action: "state_change".to_string(),
            max_attempts: 5,
            ..Default::default()
        })
        .unwrap();

        let executor = AlwaysFails;
        for attempt in 1..=3u32 {
            q.run_once(&executor, 10).await.unwrap();
            let rows: Vec<RetryQueueItem> = {
                let conn = q.conn.lock().unwrap();
                let mut stmt = conn.prepare("SELECT id, action, target_id, payload, status, attempts, max_attempts, last_error, next_retry_at, created_at FROM retry_queue").unwrap();
                stmt.query_map([], row_to_item).unwrap().collect::<rusqlite::Result<Vec<_>>>().unwrap()
            };
            let item = &rows[0];
            assert_eq!(item.attempts, attempt);
            let next: chrono::DateTime<Utc> = item.next_retry_at.parse().unwrap();
            let created: chrono::DateTime<Utc> = item.created_at.parse().unwrap();
            let delta = (next - created).num_seconds();
            let expected = backoff_secs(attempt) as i64;
            assert!((delta - expected).abs() <= 1, "attempt {attempt}: got {delta}s, expected ~{expected}s");
            // Force next_retry_at into the past so the next run_once claims it again.
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE retry_queue SET next_retry_at = ?1 WHERE id = ?2", params!["2020-01-01T00:00:00Z", item.id]).unwrap();
        }
    }

    #[tokio::test]
    async fn succeeds_on_fourth_attempt_after_three_failures() {
        let q = queue();
        q.enqueue(NewRetryItem {
            action: "add_comment".to_string(),
            max_attempts: 5,
            ..Default::default()
        })
        .unwrap();
        let executor = FailsNTimes {
            remaining: AtomicU32::new(3),
        };
        for _ in 0..4 {
            q.run_once(&executor, 10).await.unwrap();
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE retry_queue SET next_retry_at = ?1 WHERE next_retry_at > ?1", params!["2020-01-01T00:00:00Z"]).unwrap();
        }
        let rows: Vec<RetryQueueItem> = {
            let conn = q.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id, action, target_id, payload, status, attempts, max_attempts, last_error, next_retry_at, created_at FROM retry_queue").unwrap();
            stmt.query_map([], row_to_item).unwrap().collect::<rusqlite::Result<Vec<_>>>().unwrap()
        };
        assert_eq!(rows[0].status, RetryStatus::Completed);
        assert_eq!(rows[0].attempts, 4);
        assert_eq!(rows[0].last_error, None);
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts() {
        let q = queue();
        q.enqueue(NewRetryItem {
            action: "state_change".to_string(),
            max_attempts: 2,
            ..Default::default()
        })
        .unwrap();
        let executor = AlwaysFails;
        for _ in 0..2 {
            q.run_once(&executor, 10).await.unwrap();
            let conn = q.conn.lock().unwrap();
            conn.execute("UPDATE retry_queue SET next_retry_at = ?1 WHERE next_retry_at > ?1", params!["2020-01-01T00:00:00Z"]).unwrap();
        }
        let rows: Vec<RetryQueueItem> = {
            let conn = q.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT id, action, target_id, payload, status, attempts, max_attempts, last_error, next_retry_at, created_at FROM retry_queue").unwrap();
            stmt.query_map([], row_to_item).unwrap().collect::<rusqlite::Result<Vec<_>>>().unwrap()
        };
        assert_eq!(rows[0].status, RetryStatus::Failed);
    }

    #[test]
    fn purge_removes_only_old_completed_rows() {
        let q = queue();
        let item = q
            .enqueue(NewRetryItem {
                action: "state_change".to_string(),
                ..Default::default()
            })
            .unwrap();
        q.record_success(&item.id).unwrap();
        {
            let conn = q.conn.lock().unwrap();
            conn.execute(
                "UPDATE retry_queue SET created_at = ?1 WHERE id = ?2",
                params!["2000-01-01T00:00:00Z", item.id],
            )
            .unwrap();
        }
        let purged = q.purge_completed(7).unwrap();
        assert_eq!(purged, 1);
    }
}
