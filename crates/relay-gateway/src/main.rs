use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod http;
mod lock;
mod retry_executor;
mod ws;

#[derive(Parser, Debug)]
#[command(name = "relay-gateway", about = "Multi-channel personal-assistant relay gateway")]
struct Cli {
    /// Path to the TOML config file. Falls back to `RELAY_CONFIG`, then
    /// `~/.relay/relay.toml`.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("RELAY_CONFIG").ok());
    let config = relay_core::config::RelayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        relay_core::config::RelayConfig::default()
    });

    let _lock = lock::LockGuard::acquire(&config.database.lock_path)?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let shutdown = CancellationToken::new();
    let state = app::AppState::new(config)?;

    // Dispatcher worker: the single point of serialisation for every turn
    // across every channel, wired straight to the Response Pipeline.
    let dispatcher = state.dispatcher.clone();
    let pipeline = state.pipeline.clone();
    let handler: relay_dispatcher::TurnHandler = Arc::new(move |inbound| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let _ = pipeline.handle_turn(inbound).await;
        })
    });
    tokio::spawn(async move {
        dispatcher.run(handler).await;
    });

    // Channel adapters: connect with backoff, then run until shutdown.
    let channels = state.channels.clone();
    tokio::spawn(async move {
        channels.connect_all().await;
    });

    // Consolidator: periodic batch summarization independent of any one
    // channel's idle timer.
    let consolidator = state.consolidator.clone();
    let consolidator_cancel = shutdown.child_token();
    tokio::spawn(async move {
        consolidator.run_periodic(consolidator_cancel).await;
    });

    // Retry queue: poll-and-claim worker plus a daily purge of old rows.
    let retry_queue = state.retry_queue.clone();
    let retry_executor: Arc<dyn relay_retryqueue::ActionExecutor> =
        Arc::new(retry_executor::NoopProjectTrackerExecutor);
    let retry_cfg = state.config.retry_queue.clone();
    let worker_cancel = shutdown.child_token();
    tokio::spawn(relay_retryqueue::run_worker_loop(
        retry_queue.clone(),
        retry_executor,
        Duration::from_millis(retry_cfg.poll_interval_ms),
        retry_cfg.batch_size,
        worker_cancel,
    ));
    let purge_cancel = shutdown.child_token();
    tokio::spawn(relay_retryqueue::run_purge_loop(
        retry_queue,
        retry_cfg.purge_completed_after_days,
        purge_cancel,
    ));

    // Approval sweeper: reap expired confirmations so they never surface
    // to a user as a stale pending action.
    let approvals = state.approvals.clone();
    let sweeper_cancel = shutdown.child_token();
    tokio::spawn(relay_postprocess::approval::run_sweeper(
        approvals,
        Duration::from_secs(60),
        sweeper_cancel,
    ));

    // Nudge checker: follow up on delivered replies the user never
    // acknowledged.
    let delivery = state.delivery.clone();
    let nudge_interval = Duration::from_millis(state.config.delivery.nudge_check_interval_ms);
    let nudge_cancel = shutdown.child_token();
    tokio::spawn(relay_delivery::engine::run_nudge_checker(
        delivery,
        nudge_interval,
        |channel: &str, count: usize| info!(channel, count, "nudging an unacknowledged response"),
        nudge_cancel,
    ));

    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "relay gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
