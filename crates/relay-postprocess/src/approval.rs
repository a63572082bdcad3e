use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, instrument};

use relay_core::types::PendingActionId;

use crate::error::{PostprocessError, Result};

/// Enough information to edit or reply to the message that prompted a
/// confirmation, without the store knowing anything about the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub channel: String,
    pub recipient_id: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub id: PendingActionId,
    pub description: String,
    pub session_id: Option<String>,
    pub agent: String,
    pub channel: String,
    pub transport_handle: TransportHandle,
    pub created_at: Instant,
    pub ttl: Duration,
}

/// Default time-to-live for a stored confirmation before the sweeper reaps
/// it unanswered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// In-memory map of confirmations awaiting a user's approve/deny. All
/// operations are O(1); `remove` racing the sweeper's expiry pass is safe —
/// `DashMap::remove` returns `Some` to exactly one caller.
pub struct ApprovalStore {
    actions: DashMap<String, PendingAction>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self {
            actions: DashMap::new(),
        }
    }

    #[instrument(skip(self, description, transport_handle))]
    pub fn store(
        &self,
        description: String,
        agent: String,
        channel: String,
        session_id: Option<String>,
        transport_handle: TransportHandle,
        ttl: Duration,
    ) -> PendingActionId {
        let id = PendingActionId::new();
        self.actions.insert(
            id.as_str().to_string(),
            PendingAction {
                id: id.clone(),
                description,
                session_id,
                agent,
                channel,
                transport_handle,
                created_at: Instant::now(),
                ttl,
            },
        );
        id
    }

    pub fn get(&self, id: &PendingActionId) -> Option<PendingAction> {
        self.actions.get(id.as_str()).map(|r| r.value().clone())
    }

    pub fn remove(&self, id: &PendingActionId) -> Result<PendingAction> {
        self.actions
            .remove(id.as_str())
            .map(|(_, action)| action)
            .ok_or_else(|| PostprocessError::NotFound(id.as_str().to_string()))
    }

    /// Remove every entry whose `ttl` has elapsed. Returns the count reaped.
    #[instrument(skip(self))]
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .actions
            .iter()
            .filter(|entry| entry.created_at.elapsed() >= entry.ttl)
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.actions.remove(&key);
        }
        if count > 0 {
            info!(count, "swept expired pending actions");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Run [`ApprovalStore::sweep_expired`] on `interval` until cancelled.
pub async fn run_sweeper(
    store: std::sync::Arc<ApprovalStore>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                store.sweep_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TransportHandle {
        TransportHandle {
            channel: "tg".to_string(),
            recipient_id: "42".to_string(),
            message_id: Some("100".to_string()),
        }
    }

    #[test]
    fn store_then_get_round_trips() {
        let store = ApprovalStore::new();
        let id = store.store(
            "restart the database".to_string(),
            "general".to_string(),
            "tg".to_string(),
            None,
            handle(),
            DEFAULT_TTL,
        );
        let action = store.get(&id).unwrap();
        assert_eq!(action.description, "restart the database");
    }

    #[test]
    fn remove_is_single_winner() {
        let store = ApprovalStore::new();
        let id = store.store(
            "deploy".to_string(),
            "general".to_string(),
            "tg".to_string(),
            None,
            handle(),
            DEFAULT_TTL,
        );
        assert!(store.remove(&id).is_ok());
        assert!(store.remove(&id).is_err());
    }

    #[test]
    fn sweep_reaps_only_expired_entries() {
        let store = ApprovalStore::new();
        let expired_id = store.store(
            "expired".to_string(),
            "general".to_string(),
            "tg".to_string(),
            None,
            handle(),
            Duration::from_secs(0),
        );
        let fresh_id = store.store(
            "fresh".to_string(),
            "general".to_string(),
            "tg".to_string(),
            None,
            handle(),
            DEFAULT_TTL,
        );
        std::thread::sleep(Duration::from_millis(5));
        let reaped = store.sweep_expired();
        assert_eq!(reaped, 1);
        assert!(store.get(&expired_id).is_none());
        assert!(store.get(&fresh_id).is_some());
    }
}
