//! Default [`ActionExecutor`] binding for the Retry Queue (§4.J).
//!
//! The actual external collaborator — a project tracker — is out of scope
//! (§1: "every feature-specific API endpoint that simply bridges an HTTP
//! call to a database write" is assumed external). This binding logs every
//! attempt and reports failure so queued items age through the normal
//! backoff schedule and eventually dead-letter rather than silently
//! vanishing, matching the no-op convention used for [`relay_model::NoopFetcher`].
//! A deployment with a real tracker swaps this for its own `ActionExecutor`.

use async_trait::async_trait;
use tracing::warn;

use relay_retryqueue::{ActionExecutor, AttemptOutcome, RetryQueueItem};

pub struct NoopProjectTrackerExecutor;

#[async_trait]
impl ActionExecutor for NoopProjectTrackerExecutor {
    async fn attempt(&self, item: &RetryQueueItem) -> AttemptOutcome {
        warn!(
            action = %item.action,
            target_id = ?item.target_id,
            "no project tracker client configured, failing retry queue item"
        );
        AttemptOutcome::Failure("no project tracker client configured".to_string())
    }
}
