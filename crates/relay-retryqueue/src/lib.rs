//! Durable FIFO retry queue for best-effort sync of state changes to an
//! external collaborator (e.g. a project tracker) — the `plane_sync_queue`
//! table (§6). Exponential backoff, dead-lettering, and `SKIP LOCKED`-style
//! safe concurrency, emulated over SQLite with an immediate-mode claim
//! transaction since SQLite has no row-level `FOR UPDATE`.

pub mod backoff;
pub mod db;
pub mod engine;
pub mod error;
pub mod types;

pub use engine::{run_purge_loop, run_worker_loop, ActionExecutor, RetryQueue};
pub use error::{Result, RetryQueueError};
pub use types::{AttemptOutcome, NewRetryItem, RetryQueueItem, RetryStatus};
