use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, instrument, warn};

use relay_channels::{InboundMessage, OutboundMessage};
use relay_core::config::WebhookConfig;
use relay_delivery::engine::DeliveryEngine;
use relay_delivery::types::DeliveryOptions;
use relay_model::{ResponsePipeline, TurnOutcome};

/// Outcome of racing a unit of work against a deadline.
pub enum RaceOutcome<T> {
    /// The work finished before the deadline — respond with its payload.
    Answered(T),
    /// The deadline fired first. The caller already has an acknowledgement
    /// to send back; the work keeps running on its own task and `on_late`
    /// runs once it finishes.
    Acknowledged,
}

/// Spawns `work` so it keeps running regardless of which branch of the race
/// wins, then races a handle to it against `deadline`. If the deadline wins,
/// `on_late` is scheduled to run with the eventual result — never both
/// branches, and never neither: this is the `responded` exactly-once
/// guarantee expressed as control flow instead of a boolean flag.
#[instrument(skip(work, on_late))]
pub async fn race<T, F, L, LFut>(work: F, deadline: Duration, on_late: L) -> RaceOutcome<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
    L: FnOnce(T) -> LFut + Send + 'static,
    LFut: Future<Output = ()> + Send,
{
    let mut handle = tokio::spawn(work);
    tokio::select! {
        result = &mut handle => match result {
            Ok(value) => RaceOutcome::Answered(value),
            Err(e) => {
                warn!(error = %e, "webhook race task panicked before the deadline");
                RaceOutcome::Acknowledged
            }
        },
        _ = sleep(deadline) => {
            info!("webhook deadline elapsed before the pipeline finished, answering late");
            tokio::spawn(async move {
                if let Ok(value) = handle.await {
                    on_late(value).await;
                }
            });
            RaceOutcome::Acknowledged
        }
    }
}

/// What the webhook endpoint sends back as its synchronous HTTP response.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub text: String,
    pub confirmations_delivered: usize,
    /// `true` when the deadline won the race — `text` is a generic
    /// acknowledgement, not the model's actual reply.
    pub deferred: bool,
}

/// Races a [`ResponsePipeline`] turn against [`WebhookConfig::deadline_ms`].
/// On a late finish, the real answer is pushed out through the Delivery
/// Engine with a fallback channel enabled, since the synchronous HTTP
/// response that would otherwise have carried it is already gone.
pub struct WebhookCoordinator {
    deadline: Duration,
    delivery: Arc<DeliveryEngine>,
    delivery_opts: DeliveryOptions,
}

impl WebhookCoordinator {
    pub fn new(
        config: &WebhookConfig,
        delivery: Arc<DeliveryEngine>,
        fallback_channel: Option<String>,
    ) -> Self {
        Self {
            deadline: Duration::from_millis(config.deadline_ms),
            delivery,
            delivery_opts: DeliveryOptions {
                fallback_channel,
                ..DeliveryOptions::default()
            },
        }
    }

    #[instrument(skip(self, pipeline, inbound), fields(channel = %inbound.channel))]
    pub async fn handle(&self, pipeline: Arc<ResponsePipeline>, inbound: InboundMessage) -> WebhookReply {
        let channel = inbound.channel.clone();
        let recipient = inbound.sender_id.clone();
        let delivery = self.delivery.clone();
        let opts = self.delivery_opts.clone();

        let turn = async move { pipeline.handle_turn(inbound).await };

        let outcome = race(turn, self.deadline, move |outcome: TurnOutcome| async move {
            let msg = OutboundMessage::text(channel, recipient, outcome.cleaned_text);
            if let Err(e) = delivery.deliver(msg, &opts).await {
                warn!(error = %e, "late webhook delivery failed");
            }
        })
        .await;

        match outcome {
            RaceOutcome::Answered(outcome) => WebhookReply {
                text: outcome.cleaned_text,
                confirmations_delivered: outcome.confirmations_delivered,
                deferred: false,
            },
            RaceOutcome::Acknowledged => WebhookReply {
                text: "Working on it — I'll follow up shortly.".to_string(),
                confirmations_delivered: 0,
                deferred: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn fast_work_answers_before_the_deadline() {
        let outcome = race(
            async { 42 },
            Duration::from_millis(200),
            |_: i32| async {},
        )
        .await;
        assert!(matches!(outcome, RaceOutcome::Answered(42)));
    }

    #[tokio::test]
    async fn slow_work_acknowledges_then_calls_on_late() {
        let late_value = Arc::new(Mutex::new(None));
        let late_value_clone = late_value.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let outcome = race(
            async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                "done".to_string()
            },
            Duration::from_millis(5),
            move |value: String| async move {
                *late_value_clone.lock().unwrap() = Some(value);
                fired_clone.store(true, Ordering::SeqCst);
            },
        )
        .await;

        assert!(matches!(outcome, RaceOutcome::Acknowledged));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(late_value.lock().unwrap().as_deref(), Some("done"));
    }
}
