use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use relay_channels::{InlineAction, InlineActionKind, InboundMessage, OutboundMessage};
use relay_core::config::{DeliveryConfig, ModelConfig};
use relay_core::types::MessageRole;
use relay_delivery::engine::DeliveryEngine;
use relay_delivery::types::{DeliveryOptions, DeliveryResult};
use relay_memory::manager::MemoryManager;
use relay_memory::types::NewMemory;
use relay_postprocess::approval::{ApprovalStore, TransportHandle, DEFAULT_TTL};
use relay_postprocess::extractor::extract;
use relay_sessions::manager::SessionManager;

use crate::error::Result;
use crate::gateway::InvokeOptions;
use crate::pipeline::context::{ContextAssembler, StaticFragments};

/// Routes an inbound message to the agent that should handle it. The
/// default single-agent deployment never needs more than
/// [`GeneralAgentRouter`]; a classifier-backed router falls back to
/// `"general"` whenever it can't decide rather than ever returning an error
/// mid-turn.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn route(&self, channel: &str, content: &str) -> String;
}

/// Single-agent default: every message is handled by `"general"`.
pub struct GeneralAgentRouter;

#[async_trait]
impl AgentRouter for GeneralAgentRouter {
    async fn route(&self, _channel: &str, _content: &str) -> String {
        "general".to_string()
    }
}

/// Result of running a multi-step execution — a caller-provided chain of
/// several agents (pipeline, fan-out, or critic-loop). `completed` is false
/// when the chain had to stop partway; `text` is still whatever the chain
/// produced so far, never discarded.
pub struct MultiStepOutcome {
    pub text: String,
    pub completed: bool,
}

/// A caller-supplied orchestrator for the multi-step execution mode. The
/// pipeline announces [`MultiStepOrchestrator::announcement`] to the user
/// before running it, then treats whatever comes back as the model's reply
/// for the rest of the turn (tag extraction, delivery, memory persistence).
#[async_trait]
pub trait MultiStepOrchestrator: Send + Sync {
    /// Sent to the user before the chain starts, e.g. "Working through this
    /// across a few steps…".
    fn announcement(&self) -> String;

    async fn run(&self, prompt: &str) -> MultiStepOutcome;
}

/// Which path [`ResponsePipeline::handle_turn`] takes for one turn.
#[derive(Clone)]
pub enum ExecutionMode {
    /// One model invocation resuming the channel's persisted session.
    SingleAgent,
    /// A caller-provided chain of several agents.
    MultiStep(Arc<dyn MultiStepOrchestrator>),
}

/// What one turn produced, for callers that want to inspect or log it
/// beyond what was already delivered.
pub struct TurnOutcome {
    pub cleaned_text: String,
    pub delivery: Option<DeliveryResult>,
    pub confirmations_delivered: usize,
    pub playbook_commands: Vec<String>,
}

/// Tunables the pipeline needs that don't belong to any one collaborator —
/// mirrors how [`relay_core::config::ModelConfig`] and
/// [`relay_core::config::DeliveryConfig`] are already split out at the
/// config layer.
pub struct PipelineConfig {
    pub system_preamble: String,
    pub allowed_tools: Vec<String>,
    pub timeout_with_tools: Duration,
    pub timeout_without_tools: Duration,
    pub delivery: DeliveryOptions,
    pub confirmation_ttl: Duration,
}

impl PipelineConfig {
    pub fn from_relay_config(
        system_preamble: impl Into<String>,
        allowed_tools: Vec<String>,
        model: &ModelConfig,
        delivery: &DeliveryConfig,
    ) -> Self {
        Self {
            system_preamble: system_preamble.into(),
            allowed_tools,
            timeout_with_tools: Duration::from_millis(model.timeout_with_tools_ms),
            timeout_without_tools: Duration::from_millis(model.timeout_without_tools_ms),
            delivery: DeliveryOptions {
                fallback_channel: None,
                max_retries: delivery.max_retries,
                retry_base_ms: delivery.retry_base_ms,
            },
            confirmation_ttl: DEFAULT_TTL,
        }
    }
}

/// Orchestrates one full turn: save the user message, route it to an agent,
/// assemble context, invoke the model (or a multi-step chain), post-process
/// the reply, persist whatever it asked to remember, register any
/// confirmations, and deliver the cleaned text back to the channel it came
/// from.
///
/// This is the body a [`relay_dispatcher::Dispatcher`] drives through a
/// `TurnHandler` closure — the dispatcher owns queuing, the single in-flight
/// permit, and the typing heartbeat; this type owns everything that happens
/// once a turn has its turn.
pub struct ResponsePipeline {
    memory: Arc<MemoryManager>,
    sessions: Arc<SessionManager>,
    model: Arc<dyn ModelInvoker>,
    context: Arc<ContextAssembler>,
    approvals: Arc<ApprovalStore>,
    delivery: Arc<DeliveryEngine>,
    router: Arc<dyn AgentRouter>,
    statics: StaticFragments,
    config: PipelineConfig,
}

/// Abstracts [`crate::gateway::ModelGateway::invoke`] behind a trait so the
/// pipeline can be exercised with a fake in tests without spawning a real
/// subprocess.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, prompt: &str, opts: InvokeOptions) -> Result<String>;

    /// The persisted session id, if any — stashed on a `PendingAction` so an
    /// approved confirmation can resume the same conversation.
    fn current_session_id(&self) -> Option<String>;
}

#[async_trait]
impl ModelInvoker for crate::gateway::ModelGateway {
    async fn invoke(&self, prompt: &str, opts: InvokeOptions) -> Result<String> {
        crate::gateway::ModelGateway::invoke(self, prompt, opts).await
    }

    fn current_session_id(&self) -> Option<String> {
        crate::gateway::ModelGateway::current_session_id(self)
    }
}

impl ResponsePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<MemoryManager>,
        sessions: Arc<SessionManager>,
        model: Arc<dyn ModelInvoker>,
        context: Arc<ContextAssembler>,
        approvals: Arc<ApprovalStore>,
        delivery: Arc<DeliveryEngine>,
        router: Arc<dyn AgentRouter>,
        statics: StaticFragments,
        config: PipelineConfig,
    ) -> Self {
        Self {
            memory,
            sessions,
            model,
            context,
            approvals,
            delivery,
            router,
            statics,
            config,
        }
    }

    /// Runs one full turn for `inbound`, in single-agent mode.
    pub async fn handle_turn(&self, inbound: InboundMessage) -> TurnOutcome {
        self.handle_turn_with_mode(inbound, ExecutionMode::SingleAgent)
            .await
    }

    #[instrument(skip(self, inbound, mode), fields(channel = %inbound.channel, sender = %inbound.sender_id))]
    pub async fn handle_turn_with_mode(
        &self,
        inbound: InboundMessage,
        mode: ExecutionMode,
    ) -> TurnOutcome {
        let conversation = self
            .memory
            .get_or_create_open_conversation(&inbound.channel)
            .map_err(|e| warn!(error = %e, "could not open a conversation for this channel"))
            .ok();
        let conv_id = conversation.as_ref().map(|c| c.id.clone());

        if let Err(e) =
            self.memory
                .save_message(MessageRole::User, &inbound.content, &inbound.channel, conv_id.as_deref())
        {
            warn!(error = %e, "failed to persist inbound message");
        }
        self.delivery.acknowledge_channel(&inbound.channel);

        let agent = self.router.route(&inbound.channel, &inbound.content).await;
        if let Err(e) = self.sessions.get_or_create_active(&inbound.channel, &agent) {
            warn!(error = %e, "failed to attribute an agent session to this turn");
        } else if let Err(e) = self.sessions.touch(&inbound.channel) {
            warn!(error = %e, "failed to touch agent session activity");
        }

        let prompt = self
            .context
            .assemble(
                &inbound.channel,
                &self.config.system_preamble,
                &self.statics,
                &inbound.content,
            )
            .await;

        let transport = TransportHandle {
            channel: inbound.channel.clone(),
            recipient_id: inbound.sender_id.clone(),
            message_id: None,
        };

        if let ExecutionMode::MultiStep(orchestrator) = &mode {
            let announce =
                OutboundMessage::text(&inbound.channel, &inbound.sender_id, orchestrator.announcement());
            let _ = self.delivery.deliver(announce, &self.config.delivery).await;
        }

        let raw_reply = self.run_model(&prompt, &mode).await;
        let extraction = extract(&raw_reply);

        self.persist_memory_intents(&extraction, &agent, conv_id.as_deref());
        self.resolve_done_intents(&extraction, &agent);
        for finding in &extraction.findings {
            info!(
                finding_type = %finding.finding_type,
                confidence = finding.confidence,
                "dropping finding with no configured forest/awareness sink"
            );
        }

        let session_id = self.model.current_session_id();
        let action_ids: Vec<_> = extraction
            .confirmations
            .iter()
            .map(|c| {
                self.approvals.store(
                    c.description.clone(),
                    agent.clone(),
                    inbound.channel.clone(),
                    session_id.clone(),
                    transport.clone(),
                    self.config.confirmation_ttl,
                )
            })
            .collect();

        let primary =
            OutboundMessage::text(&inbound.channel, &inbound.sender_id, extraction.cleaned_text.clone());
        let delivery = self
            .delivery
            .deliver(primary, &self.config.delivery)
            .await
            .map_err(|e| warn!(error = %e, "failed to deliver response"))
            .ok();

        let mut confirmations_delivered = 0;
        for (confirmation, id) in extraction.confirmations.iter().zip(action_ids.iter()) {
            let mut msg = OutboundMessage::text(
                &inbound.channel,
                &inbound.sender_id,
                confirmation.description.clone(),
            );
            // Each button carries the same pending-action id but a distinct
            // suffix so the transport's callback can tell them apart —
            // `action_id` alone is ambiguous once both buttons share it.
            msg.actions.push(InlineAction {
                action_id: format!("{}:approve", id.as_str()),
                label: "Approve".to_string(),
                kind: InlineActionKind::Approve,
            });
            msg.actions.push(InlineAction {
                action_id: format!("{}:deny", id.as_str()),
                label: "Deny".to_string(),
                kind: InlineActionKind::Deny,
            });
            if self.delivery.deliver(msg, &self.config.delivery).await.is_ok() {
                confirmations_delivered += 1;
            }
        }

        if let Err(e) = self.memory.save_message(
            MessageRole::Assistant,
            &extraction.cleaned_text,
            &inbound.channel,
            conv_id.as_deref(),
        ) {
            warn!(error = %e, "failed to persist assistant reply");
        }

        TurnOutcome {
            cleaned_text: extraction.cleaned_text,
            delivery,
            confirmations_delivered,
            playbook_commands: extraction.playbook_commands,
        }
    }

    async fn run_model(&self, prompt: &str, mode: &ExecutionMode) -> String {
        match mode {
            ExecutionMode::SingleAgent => {
                let has_tools = !self.config.allowed_tools.is_empty();
                let opts = InvokeOptions {
                    resume_session: true,
                    allowed_tools: self.config.allowed_tools.clone(),
                    model: None,
                    timeout: if has_tools {
                        self.config.timeout_with_tools
                    } else {
                        self.config.timeout_without_tools
                    },
                    session_override: None,
                };
                match self.model.invoke(prompt, opts).await {
                    Ok(text) => text,
                    Err(e) => e.user_message(),
                }
            }
            ExecutionMode::MultiStep(orchestrator) => {
                let outcome = orchestrator.run(prompt).await;
                if outcome.completed {
                    outcome.text
                } else {
                    format!("{}\n\n[execution incomplete]", outcome.text)
                }
            }
        }
    }

    fn persist_memory_intents(
        &self,
        extraction: &relay_postprocess::extractor::ExtractionResult,
        agent: &str,
        conv_id: Option<&str>,
    ) {
        for intent in &extraction.memory_intents {
            let new = NewMemory {
                memory_type: relay_memory::types::MemoryType::Fact,
                content: intent.content.clone(),
                source_agent: agent.to_string(),
                visibility: intent.visibility,
                deadline: None,
                conversation_id: conv_id.map(str::to_string),
            };
            if let Err(e) = self.memory.insert_with_dedup(new) {
                warn!(error = %e, "failed to persist a [REMEMBER] memory intent");
            }
        }
        for intent in &extraction.goal_intents {
            let new = NewMemory {
                memory_type: relay_memory::types::MemoryType::Goal,
                content: intent.content.clone(),
                source_agent: agent.to_string(),
                visibility: relay_core::types::Visibility::Shared,
                deadline: intent.deadline.clone(),
                conversation_id: conv_id.map(str::to_string),
            };
            if let Err(e) = self.memory.insert_with_dedup(new) {
                warn!(error = %e, "failed to persist a [GOAL] memory intent");
            }
        }
    }

    fn resolve_done_intents(
        &self,
        extraction: &relay_postprocess::extractor::ExtractionResult,
        agent: &str,
    ) {
        for intent in &extraction.done_intents {
            match self.memory.find_active_goal(&intent.search, Some(agent)) {
                Ok(Some(goal)) => {
                    if let Err(e) = self.memory.complete_goal(&goal.id) {
                        warn!(error = %e, "failed to mark goal completed");
                    }
                }
                Ok(None) => {
                    warn!(search = %intent.search, "no active goal matched a [DONE] marker");
                }
                Err(e) => warn!(error = %e, "goal lookup failed for a [DONE] marker"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_channels::manager::ChannelManager;
    use relay_channels::{ChannelError, ChannelStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl relay_channels::channel::Channel for RecordingChannel {
        fn name(&self) -> &str {
            "test"
        }
        async fn connect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn disconnect(&self) -> std::result::Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, msg: &OutboundMessage) -> std::result::Result<(), ChannelError> {
            self.sent.lock().unwrap().push(msg.content.clone());
            Ok(())
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
    }

    struct FakeModel {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelInvoker for FakeModel {
        async fn invoke(&self, _prompt: &str, _opts: InvokeOptions) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
        fn current_session_id(&self) -> Option<String> {
            None
        }
    }

    fn memory() -> Arc<MemoryManager> {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        relay_memory::db::init_db(&conn).unwrap();
        Arc::new(MemoryManager::new(conn))
    }

    fn sessions() -> Arc<SessionManager> {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        relay_sessions::db::init_db(&conn).unwrap();
        Arc::new(SessionManager::new(conn))
    }

    fn pipeline(reply: &str) -> (Arc<ResponsePipeline>, Arc<ChannelManager>) {
        let manager = ChannelManager::new();
        manager.register(Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        }));
        let manager = Arc::new(manager);
        let delivery = Arc::new(DeliveryEngine::new(manager.clone()));
        let config = PipelineConfig {
            system_preamble: "you are a helpful relay".to_string(),
            allowed_tools: Vec::new(),
            timeout_with_tools: Duration::from_secs(30),
            timeout_without_tools: Duration::from_secs(10),
            delivery: DeliveryOptions::default(),
            confirmation_ttl: DEFAULT_TTL,
        };
        let model: Arc<dyn ModelInvoker> = Arc::new(FakeModel {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        let p = ResponsePipeline::new(
            memory(),
            sessions(),
            model,
            Arc::new(ContextAssembler::new(Duration::from_millis(500))),
            Arc::new(ApprovalStore::new()),
            delivery,
            Arc::new(GeneralAgentRouter),
            StaticFragments::default(),
            config,
        );
        (Arc::new(p), manager)
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "test".to_string(),
            sender_id: "42".to_string(),
            sender_name: None,
            content: content.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            raw_payload: None,
        }
    }

    #[tokio::test]
    async fn plain_reply_is_saved_and_delivered_unchanged() {
        let (pipeline, _channels) = pipeline("Sure, done.");
        let outcome = pipeline.handle_turn(inbound("hello there")).await;
        assert_eq!(outcome.cleaned_text, "Sure, done.");
        assert!(outcome.delivery.is_some());
        assert_eq!(outcome.confirmations_delivered, 0);
    }

    #[tokio::test]
    async fn remember_marker_persists_to_memory_and_is_stripped_from_reply() {
        let (pipeline, _channels) = pipeline("Got it. [REMEMBER: likes oolong tea]");
        let outcome = pipeline.handle_turn(inbound("note this")).await;
        assert_eq!(outcome.cleaned_text, "Got it.");
        let found = pipeline
            .memory
            .search_memory("oolong", 10)
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn confirm_marker_registers_a_pending_action_and_delivers_inline_controls() {
        let (pipeline, _channels) = pipeline("About to restart it. [CONFIRM: restart the database]");
        let outcome = pipeline.handle_turn(inbound("restart it please")).await;
        assert_eq!(outcome.confirmations_delivered, 1);
        assert_eq!(pipeline.approvals.len(), 1);
    }

    #[tokio::test]
    async fn multi_step_mode_announces_then_delivers_orchestrator_output() {
        struct TwoStep;
        #[async_trait]
        impl MultiStepOrchestrator for TwoStep {
            fn announcement(&self) -> String {
                "Working through this in a few steps…".to_string()
            }
            async fn run(&self, _prompt: &str) -> MultiStepOutcome {
                MultiStepOutcome {
                    text: "Step one done, step two done.".to_string(),
                    completed: true,
                }
            }
        }

        let (pipeline, channels) = pipeline("unused");
        let outcome = pipeline
            .handle_turn_with_mode(inbound("do the multi-step thing"), ExecutionMode::MultiStep(Arc::new(TwoStep)))
            .await;
        assert_eq!(outcome.cleaned_text, "Step one done, step two done.");
        let sent = channels.get("test").unwrap();
        let _ = sent;
    }
}
