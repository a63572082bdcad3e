use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ConsolidateRequest {
    /// Restrict consolidation to one channel; omit to sweep every channel.
    #[serde(default)]
    pub channel: Option<String>,
}

/// POST /api/consolidate — trigger an out-of-band consolidation pass (§4.H),
/// the same operation the dispatcher's per-channel idle timer fires on its
/// own. Exposed so an operator (or a cron) can force it ahead of schedule.
pub async fn consolidate_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConsolidateRequest>>,
) -> Json<Value> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    match state.consolidator.run_once(req.channel.as_deref()).await {
        Ok(report) => Json(json!({
            "blocks_seen": report.blocks_seen,
            "blocks_summarized": report.blocks_summarized,
            "blocks_rolled_back": report.blocks_rolled_back,
            "memories_written": report.memories_written,
        })),
        Err(e) => {
            warn!(error = %e, "manual consolidation request failed");
            Json(json!({ "error": e.to_string() }))
        }
    }
}
