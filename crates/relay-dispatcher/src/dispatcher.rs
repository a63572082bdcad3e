use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_channels::manager::ChannelManager;
use relay_channels::InboundMessage;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::types::{preview_of, CurrentItem, CurrentSnapshot, QueueStatus, QueuedItem, QueuedSnapshot};

pub type TurnFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
/// The Response Pipeline's per-turn entry point. The dispatcher calls this
/// exactly once per dequeued message and awaits it to completion before
/// starting the next — this is the single point of serialisation shared
/// across all channels.
pub type TurnHandler = Arc<dyn Fn(InboundMessage) -> TurnFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub idle_ms: u64,
    pub typing_interval_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            idle_ms: 600_000,
            typing_interval_ms: 4_000,
        }
    }
}

struct ChannelActivity {
    last_activity_ms: AtomicI64,
    cancel: CancellationToken,
}

/// Serialises model turns across all channels behind a single FIFO worker,
/// while tracking a per-channel idle timer fleet and driving the typing
/// heartbeat for whichever channel currently has a turn in flight.
///
/// A single shared queue gives every channel FIFO ordering for its own
/// messages for free (they never reorder relative to each other) and
/// matches the Model Gateway's single-invocation-at-a-time concurrency gate
/// without a second layer of cross-channel coordination.
pub struct Dispatcher {
    settings: DispatcherSettings,
    channels: Arc<ChannelManager>,
    queue: Mutex<VecDeque<QueuedItem>>,
    current: Mutex<Option<CurrentItem>>,
    notify: Notify,
    activity: Mutex<HashMap<String, Arc<ChannelActivity>>>,
    on_idle: Arc<dyn Fn(String) + Send + Sync>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        channels: Arc<ChannelManager>,
        settings: DispatcherSettings,
        on_idle: Arc<dyn Fn(String) + Send + Sync>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            channels,
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            notify: Notify::new(),
            activity: Mutex::new(HashMap::new()),
            on_idle,
            cancel,
        }
    }

    /// Enqueue an inbound message for `channel` and arm/reset its idle timer.
    #[instrument(skip(self, message), fields(channel))]
    pub fn enqueue(self: &Arc<Self>, channel: &str, message: InboundMessage) {
        self.touch(channel);
        let preview = preview_of(&message.content);
        self.queue.lock().unwrap().push_back(QueuedItem {
            channel: channel.to_string(),
            message,
            preview,
            enqueued_at: Instant::now(),
        });
        self.notify.notify_one();
    }

    /// Reset the idle timer for `channel` without enqueueing work — called
    /// for outbound sends too, since either direction counts as activity.
    pub fn touch(self: &Arc<Self>, channel: &str) {
        let activity = self.activity_for(channel);
        activity
            .last_activity_ms
            .store(now_ms(), Ordering::SeqCst);
    }

    fn activity_for(self: &Arc<Self>, channel: &str) -> Arc<ChannelActivity> {
        let mut map = self.activity.lock().unwrap();
        if let Some(existing) = map.get(channel) {
            return existing.clone();
        }
        let activity = Arc::new(ChannelActivity {
            last_activity_ms: AtomicI64::new(now_ms()),
            cancel: self.cancel.child_token(),
        });
        map.insert(channel.to_string(), activity.clone());
        let dispatcher = self.clone();
        let channel_owned = channel.to_string();
        let activity_spawned = activity.clone();
        tokio::spawn(async move {
            dispatcher.run_idle_timer(channel_owned, activity_spawned).await;
        });
        activity
    }

    async fn run_idle_timer(self: Arc<Self>, channel: String, activity: Arc<ChannelActivity>) {
        let idle = Duration::from_millis(self.settings.idle_ms);
        loop {
            let elapsed_ms = now_ms() - activity.last_activity_ms.load(Ordering::SeqCst);
            let remaining = idle.saturating_sub(Duration::from_millis(elapsed_ms.max(0) as u64));
            tokio::select! {
                _ = activity.cancel.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {
                    let elapsed_ms = now_ms() - activity.last_activity_ms.load(Ordering::SeqCst);
                    if elapsed_ms as u64 >= self.settings.idle_ms {
                        info!(channel = %channel, "channel idle timer fired");
                        (self.on_idle)(channel.clone());
                    }
                }
            }
        }
    }

    /// Drive the worker loop: dequeue one item at a time, run `handler` to
    /// completion with a typing heartbeat on the owning channel, then move
    /// to the next. Returns when `cancel` fires.
    pub async fn run(self: Arc<Self>, handler: TurnHandler) {
        loop {
            let item = {
                let mut queue = self.queue.lock().unwrap();
                queue.pop_front()
            };
            let Some(item) = item else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.notify.notified() => continue,
                };
            };

            *self.current.lock().unwrap() = Some(CurrentItem {
                channel: item.channel.clone(),
                preview: item.preview.clone(),
                started_at: Instant::now(),
            });

            let heartbeat_cancel = CancellationToken::new();
            let heartbeat = tokio::spawn(run_typing_heartbeat(
                self.channels.clone(),
                item.channel.clone(),
                item.message.sender_id.clone(),
                Duration::from_millis(self.settings.typing_interval_ms),
                heartbeat_cancel.clone(),
            ));

            debug!(channel = %item.channel, "dispatching turn");
            (handler)(item.message).await;
            self.touch(&item.channel);

            heartbeat_cancel.cancel();
            let _ = heartbeat.await;
            *self.current.lock().unwrap() = None;

            if self.cancel.is_cancelled() {
                return;
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        let queue = self.queue.lock().unwrap();
        let current = self.current.lock().unwrap();
        let now = Instant::now();
        QueueStatus {
            busy: current.is_some(),
            queue_length: queue.len(),
            current: current.as_ref().map(|c| CurrentSnapshot {
                channel: c.channel.clone(),
                preview: c.preview.clone(),
                running_ms: now.duration_since(c.started_at).as_millis() as u64,
            }),
            queued: queue
                .iter()
                .enumerate()
                .map(|(i, item)| QueuedSnapshot {
                    position: i,
                    channel: item.channel.clone(),
                    preview: item.preview.clone(),
                    waiting_ms: now.duration_since(item.enqueued_at).as_millis() as u64,
                })
                .collect(),
        }
    }
}

async fn run_typing_heartbeat(
    channels: Arc<ChannelManager>,
    channel: String,
    recipient_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Some(adapter) = channels.get(&channel) {
                    if let Err(e) = adapter.send_typing(&recipient_id).await {
                        warn!(channel = %channel, error = %e, "typing heartbeat send failed");
                    }
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_channels::{ChannelError, ChannelStatus, OutboundMessage};
    use std::sync::atomic::AtomicUsize;

    struct NoopChannel {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl relay_channels::channel::Channel for NoopChannel {
        fn name(&self) -> &str {
            "tg"
        }
        async fn connect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn disconnect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn send_typing(&self, _recipient_id: &str) -> std::result::Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
    }

    fn inbound(channel: &str, content: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.to_string(),
            sender_id: "42".to_string(),
            sender_name: None,
            content: content.to_string(),
            timestamp: "2026-07-28T00:00:00Z".to_string(),
            raw_payload: None,
        }
    }

    #[tokio::test]
    async fn turns_are_processed_in_enqueue_order() {
        let manager = ChannelManager::new();
        manager.register(Arc::new(NoopChannel {
            sent: Arc::new(AtomicUsize::new(0)),
        }));
        let channels = Arc::new(manager);
        let processed = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            channels,
            DispatcherSettings {
                idle_ms: 60_000,
                typing_interval_ms: 4_000,
            },
            Arc::new(|_channel| {}),
            cancel.clone(),
        ));

        dispatcher.enqueue("tg", inbound("tg", "first"));
        dispatcher.enqueue("tg", inbound("tg", "second"));

        let processed_clone = processed.clone();
        let handler: TurnHandler = Arc::new(move |msg| {
            let processed = processed_clone.clone();
            Box::pin(async move {
                processed.lock().unwrap().push(msg.content);
            })
        });

        let dispatcher_clone = dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher_clone.run(handler).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = run.await;

        assert_eq!(*processed.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn status_reports_queue_length() {
        let channels = Arc::new(ChannelManager::new());
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            channels,
            DispatcherSettings::default(),
            Arc::new(|_channel| {}),
            cancel,
        ));
        dispatcher.enqueue("tg", inbound("tg", "hello"));
        let status = dispatcher.status();
        assert_eq!(status.queue_length, 1);
        assert!(!status.busy);
    }
}
