use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_channels::manager::ChannelManager;
use relay_channels::{ChannelError, OutboundMessage};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::types::{DeliveryOptions, DeliveryResult, DeliveryStatus, PendingResponse};

/// How long a successful send stays in [`DeliveryEngine::pending`] before the
/// nudge checker reaps it regardless of whether it was ever nudged.
/// Overridable via [`DeliveryEngine::with_nudge_timings`]; matches
/// `DeliveryConfig::nudge_gc_ms`'s default.
const DEFAULT_NUDGE_GC: Duration = Duration::from_secs(60 * 60);
/// Age at which an un-acknowledged send is nudged. Matches
/// `DeliveryConfig::nudge_delay_ms`'s default.
const DEFAULT_NUDGE_AFTER: Duration = Duration::from_secs(5 * 60);

/// A transport-returned error a retry can plausibly fix.
fn is_retryable(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::ConnectionFailed(_) | ChannelError::SendFailed(_) | ChannelError::Timeout { .. }
    )
}

/// Sends outbound messages with bounded retry, an optional degraded
/// fallback channel, and pending-response tracking for the nudge checker.
pub struct DeliveryEngine {
    channels: Arc<ChannelManager>,
    pending: DashMap<String, PendingResponse>,
    nudge_after: Duration,
    nudge_gc: Duration,
}

impl DeliveryEngine {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self {
            channels,
            pending: DashMap::new(),
            nudge_after: DEFAULT_NUDGE_AFTER,
            nudge_gc: DEFAULT_NUDGE_GC,
        }
    }

    /// Overrides the nudge/GC timings, e.g. from `DeliveryConfig`.
    pub fn with_nudge_timings(mut self, nudge_after: Duration, nudge_gc: Duration) -> Self {
        self.nudge_after = nudge_after;
        self.nudge_gc = nudge_gc;
        self
    }

    /// Deliver `msg`, retrying on the primary channel up to
    /// `opts.max_retries` times with exponential backoff
    /// `retry_base_ms · 2^(attempt-1)`. On exhaustion, if a fallback channel
    /// is configured, one degraded-prefixed attempt is made there.
    #[instrument(skip(self, msg, opts), fields(channel = %msg.channel, recipient = %msg.recipient_id))]
    pub async fn deliver(&self, msg: OutboundMessage, opts: &DeliveryOptions) -> Result<DeliveryResult> {
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 1..=opts.max_retries.max(1) {
            attempts = attempt;
            match self.send_once(&msg).await {
                Ok(()) => {
                    self.register_pending(&msg.channel);
                    return Ok(DeliveryResult {
                        status: DeliveryStatus::Sent,
                        channel: msg.channel.clone(),
                        external_id: None,
                        attempts,
                        error: None,
                    });
                }
                Err(e) if !is_retryable(&e) => {
                    warn!(error = %e, "delivery failed with a non-retryable error");
                    last_error = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt < opts.max_retries {
                        let backoff = opts.retry_base_ms * 2u64.pow(attempt - 1);
                        warn!(attempt, backoff_ms = backoff, error = %e, "retrying delivery after backoff");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        if let Some(fallback) = &opts.fallback_channel {
            let degraded = OutboundMessage {
                channel: fallback.clone(),
                content: format!("[delivered via fallback channel] {}", msg.content),
                ..msg.clone()
            };
            match self.send_once(&degraded).await {
                Ok(()) => {
                    self.register_pending(fallback);
                    return Ok(DeliveryResult {
                        status: DeliveryStatus::Fallback,
                        channel: fallback.clone(),
                        external_id: None,
                        attempts,
                        error: last_error,
                    });
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }
        }

        Ok(DeliveryResult {
            status: DeliveryStatus::Failed,
            channel: msg.channel.clone(),
            external_id: None,
            attempts,
            error: last_error,
        })
    }

    async fn send_once(&self, msg: &OutboundMessage) -> std::result::Result<(), ChannelError> {
        let channel = self
            .channels
            .get(&msg.channel)
            .ok_or_else(|| ChannelError::ConfigError(format!("unregistered channel {}", msg.channel)))?;
        channel.send(msg).await
    }

    fn register_pending(&self, channel: &str) {
        self.pending.insert(
            channel.to_string(),
            PendingResponse {
                channel: channel.to_string(),
                sent_at: Instant::now(),
                nudged: false,
            },
        );
    }

    /// Clear the pending-response entry on `channel` — called when an
    /// inbound user message arrives, since that is the acknowledgement.
    pub fn acknowledge_channel(&self, channel: &str) {
        self.pending.remove(channel);
    }

    /// Mark every pending response older than `nudge_after` as nudged
    /// exactly once, invoking `on_nudge(channel, count)` where `count` is
    /// the number of responses nudged in this sweep, then drop entries
    /// older than `nudge_gc` regardless of nudge state.
    #[instrument(skip(self, on_nudge))]
    pub fn check_nudges(&self, on_nudge: impl Fn(&str, usize)) {
        let mut to_remove = Vec::new();
        let mut to_nudge = Vec::new();
        for mut entry in self.pending.iter_mut() {
            let age = entry.sent_at.elapsed();
            if age >= self.nudge_gc {
                to_remove.push(entry.key().clone());
                continue;
            }
            if !entry.nudged && age >= self.nudge_after {
                entry.nudged = true;
                to_nudge.push(entry.channel.clone());
            }
        }
        let count = to_nudge.len();
        for channel in &to_nudge {
            info!(channel = %channel, count, "nudging unacknowledged response");
            on_nudge(channel, count);
        }
        for key in to_remove {
            self.pending.remove(&key);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Run [`DeliveryEngine::check_nudges`] on a fixed interval until cancelled.
pub async fn run_nudge_checker(
    engine: Arc<DeliveryEngine>,
    interval: Duration,
    on_nudge: impl Fn(&str, usize) + Send + Sync + 'static,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                engine.check_nudges(&on_nudge);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_channels::ChannelStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChannel {
        name: String,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl relay_channels::channel::Channel for FlakyChannel {
        fn name(&self) -> &str {
            &self.name
        }
        async fn connect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn disconnect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<(), ChannelError> {
            let remaining = self.fail_times.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == 0 {
                    None
                } else {
                    Some(v - 1)
                }
            });
            if remaining.is_ok() {
                Err(ChannelError::SendFailed("simulated".to_string()))
            } else {
                Ok(())
            }
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
    }

    fn engine_with(fail_times: u32) -> DeliveryEngine {
        let manager = ChannelManager::new();
        manager.register(Arc::new(FlakyChannel {
            name: "tg".to_string(),
            fail_times: AtomicU32::new(fail_times),
        }));
        DeliveryEngine::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn succeeds_after_retrying_past_transient_failures() {
        let engine = engine_with(1);
        let opts = DeliveryOptions {
            retry_base_ms: 1,
            ..Default::default()
        };
        let result = engine
            .deliver(OutboundMessage::text("tg", "42", "hello"), &opts)
            .await
            .unwrap();
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn exhausting_retries_without_fallback_fails() {
        let engine = engine_with(10);
        let opts = DeliveryOptions {
            max_retries: 2,
            retry_base_ms: 1,
            ..Default::default()
        };
        let result = engine
            .deliver(OutboundMessage::text("tg", "42", "hello"), &opts)
            .await
            .unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn acknowledge_clears_pending_response() {
        let engine = engine_with(0);
        let opts = DeliveryOptions {
            retry_base_ms: 1,
            ..Default::default()
        };
        engine
            .deliver(OutboundMessage::text("tg", "42", "hello"), &opts)
            .await
            .unwrap();
        assert_eq!(engine.pending_count(), 1);
        engine.acknowledge_channel("tg");
        assert_eq!(engine.pending_count(), 0);
    }
}
