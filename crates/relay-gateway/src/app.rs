use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use relay_channels::manager::ChannelManager;
use relay_consolidator::Consolidator;
use relay_core::RelayConfig;
use relay_delivery::engine::DeliveryEngine;
use relay_memory::manager::MemoryManager;
use relay_model::pipeline::context::{MemoryFetchKind, MemoryFetcher, NoopFetcher};
use relay_model::{
    ContextAssembler, FragmentSlot, GeneralAgentRouter, ModelGateway, ModelInvoker,
    PipelineConfig, ResponsePipeline, StaticFragments,
};
use relay_postprocess::approval::ApprovalStore;
use relay_retryqueue::RetryQueue;
use relay_sessions::SessionManager;
use relay_webhook::WebhookCoordinator;

/// Central shared state — passed as `Arc<AppState>` to every Axum handler
/// and WS connection task. Every field here is itself `Arc`-wrapped or
/// internally synchronised, mirroring the teacher's own `AppState` shape:
/// one struct owning every long-lived collaborator, cloned cheaply per
/// request rather than threaded through function arguments one at a time.
pub struct AppState {
    pub config: RelayConfig,
    pub channels: Arc<ChannelManager>,
    pub webchat: Arc<crate::ws::channel::WebChatChannel>,
    pub dispatcher: Arc<relay_dispatcher::Dispatcher>,
    pub pipeline: Arc<ResponsePipeline>,
    pub memory: Arc<MemoryManager>,
    pub sessions: Arc<SessionManager>,
    pub model: Arc<ModelGateway>,
    pub approvals: Arc<ApprovalStore>,
    pub delivery: Arc<DeliveryEngine>,
    pub consolidator: Arc<Consolidator>,
    pub retry_queue: Arc<RetryQueue>,
    pub webhook: Arc<WebhookCoordinator>,
    pub shutdown: CancellationToken,
}

/// A fixed system preamble prepended to every assembled prompt. Generic and
/// deployment-agnostic by design — tenant-specific identity/policy text
/// belongs in `StaticFragments`, not baked in here.
const SYSTEM_PREAMBLE: &str = "You are a personal-assistant relay speaking through one of several \
channels. Keep replies concise and use the control markers ([REMEMBER: ...], \
[GOAL: ...], [DONE: search ...], [CONFIRM: ...]) exactly as instructed when \
they apply; never mention them to the user.";

/// Per-fragment timeout for the Context Assembler's fan-out (§4.F). Every
/// registered fetcher — including the local memory ones — is bounded by
/// this so one slow source never delays the rest of the prompt.
const CONTEXT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// How many recent messages / memory rows each local fetcher pulls per turn.
const CONTEXT_FETCH_LIMIT: u32 = 10;

impl AppState {
    /// Builds every long-lived collaborator and wires them together exactly
    /// as §4 describes: Dispatcher → Response Pipeline → (Context Assembler
    /// + Model Gateway) → Post-Processor → Delivery Engine, with the
    /// Consolidator and Retry Queue as independent background loops.
    pub fn new(config: RelayConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(
            std::path::Path::new(&config.database.path)
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
        )?;

        let memory_conn = Connection::open(&config.database.path)?;
        relay_memory::db::init_db(&memory_conn)?;
        let memory = Arc::new(MemoryManager::new(memory_conn));

        let sessions_conn = Connection::open(&config.database.path)?;
        relay_sessions::db::init_db(&sessions_conn)?;
        let sessions = Arc::new(SessionManager::new(sessions_conn));

        let retry_conn = Connection::open(&config.database.path)?;
        let retry_queue = Arc::new(RetryQueue::new(retry_conn)?);

        let channels = Arc::new(ChannelManager::new());
        let shutdown = CancellationToken::new();

        let model = Arc::new(ModelGateway::new(&config.model, &config.database.session_path));

        let delivery = Arc::new(
            DeliveryEngine::new(channels.clone()).with_nudge_timings(
                Duration::from_millis(config.delivery.nudge_delay_ms),
                Duration::from_millis(config.delivery.nudge_gc_ms),
            ),
        );

        let approvals = Arc::new(ApprovalStore::new());

        let mut context = ContextAssembler::new(CONTEXT_FETCH_TIMEOUT);
        context.register(
            FragmentSlot::RecentMessages,
            Arc::new(MemoryFetcher::new(
                memory.clone(),
                MemoryFetchKind::RecentMessages,
                CONTEXT_FETCH_LIMIT,
            )),
        );
        context.register(
            FragmentSlot::SemanticAndFullText,
            Arc::new(MemoryFetcher::new(
                memory.clone(),
                MemoryFetchKind::SemanticAndFullText,
                CONTEXT_FETCH_LIMIT,
            )),
        );
        // External collaborators this workspace has no client for yet —
        // profile, structured context, forest/awareness + live signals,
        // work-item lookup + queue context, skills snapshot. Each resolves
        // to "" per the §4.F contract rather than blocking prompt assembly.
        context.register(FragmentSlot::Profile, Arc::new(NoopFetcher::new("profile")));
        context.register(
            FragmentSlot::StructuredContext,
            Arc::new(NoopFetcher::new("structured_context")),
        );
        context.register(
            FragmentSlot::LiveSignals,
            Arc::new(NoopFetcher::new("live_signals")),
        );
        context.register(
            FragmentSlot::WorkItemContext,
            Arc::new(NoopFetcher::new("work_item_context")),
        );
        context.register(
            FragmentSlot::ActiveSkill,
            Arc::new(NoopFetcher::new("active_skill")),
        );
        let context = Arc::new(context);

        let statics = StaticFragments {
            tool_policy: String::new(),
            user_identity: String::new(),
            memory_management_policy:
                "Use [REMEMBER: ...], [GOAL: ...], and [DONE: search ...] markers to manage \
                 durable memory; they are stripped before the user sees your reply."
                    .to_string(),
            approval_policy:
                "Use [CONFIRM: ...] to ask for explicit approval before a destructive or \
                 hard-to-reverse action; do not perform it until approved."
                    .to_string(),
        };

        let model_invoker: Arc<dyn ModelInvoker> = model.clone();
        let pipeline_config = PipelineConfig::from_relay_config(
            SYSTEM_PREAMBLE,
            Vec::new(),
            &config.model,
            &config.delivery,
        );
        let pipeline = Arc::new(ResponsePipeline::new(
            memory.clone(),
            sessions.clone(),
            model_invoker,
            context,
            approvals.clone(),
            delivery.clone(),
            Arc::new(GeneralAgentRouter),
            statics,
            pipeline_config,
        ));

        let consolidator = Arc::new(Consolidator::new(
            memory.clone(),
            sessions.clone(),
            model.clone(),
            config.consolidator.clone(),
            // No caller-owned context cache exists in this workspace yet
            // (§4.H.4) — a deployment that adds one plugs its invalidation
            // in here.
            Arc::new(|_channel: &str| {}),
        ));

        let consolidator_for_idle = consolidator.clone();
        let on_idle = Arc::new(move |channel: String| {
            let consolidator = consolidator_for_idle.clone();
            tokio::spawn(async move {
                if let Err(e) = consolidator.run_once(Some(&channel)).await {
                    warn!(channel = %channel, error = %e, "idle-triggered consolidation failed");
                }
            });
        });

        let dispatcher = Arc::new(relay_dispatcher::Dispatcher::new(
            channels.clone(),
            relay_dispatcher::DispatcherSettings {
                idle_ms: config.dispatcher.idle_ms,
                typing_interval_ms: config.dispatcher.typing_interval_ms,
            },
            on_idle,
            shutdown.clone(),
        ));

        // Channel adapters are registered only once the real dispatcher
        // exists, since the Telegram adapter needs a live `Arc<Dispatcher>`
        // to enqueue onto — no placeholder dispatcher required.
        if let Some(chatbot_cfg) = &config.channels.chatbot {
            channels.register(Arc::new(relay_chatbot::TelegramChannel::new(
                chatbot_cfg.clone(),
                dispatcher.clone(),
            )));
        }
        if let Some(enterprise_cfg) = &config.channels.enterprise {
            channels.register(Arc::new(relay_enterprise::EnterpriseChannel::new(
                enterprise_cfg,
            )));
        }
        let webchat = Arc::new(crate::ws::channel::WebChatChannel::new());
        channels.register(webchat.clone());

        let fallback_channel = config
            .channels
            .chatbot
            .as_ref()
            .map(|_| "chatbot".to_string())
            .or_else(|| config.channels.enterprise.as_ref().map(|_| "enterprise".to_string()));
        let webhook = Arc::new(WebhookCoordinator::new(&config.webhook, delivery.clone(), fallback_channel));

        Ok(Arc::new(Self {
            config,
            channels,
            webchat,
            dispatcher,
            pipeline,
            memory,
            sessions,
            model,
            approvals,
            delivery,
            consolidator,
            retry_queue,
            webhook,
            shutdown,
        }))
    }
}

/// Assemble the full Axum router. Exactly the five endpoints named in §6
/// EXTERNAL INTERFACES, plus the browser chat and telephony media-stream
/// websockets.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/queue-status", get(crate::http::queue_status::queue_status_handler))
        .route("/api/consolidate", post(crate::http::consolidate::consolidate_handler))
        .route(
            "/api/conversation/close",
            post(crate::http::conversation::close_handler),
        )
        .route(
            "/api/conversation/context",
            get(crate::http::conversation::context_handler),
        )
        .route("/webhooks/{source}", post(crate::http::webhooks::webhook_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route("/ws/telephony", get(crate::ws::telephony::telephony_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
}
