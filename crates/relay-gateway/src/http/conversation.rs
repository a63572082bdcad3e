use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CloseRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// POST /api/conversation/close — close the open conversation for a channel
/// (or a specific conversation id) ahead of the Consolidator's own idle
/// trigger, e.g. when a caller knows a session has definitively ended.
pub async fn close_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CloseRequest>>,
) -> Json<Value> {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let conversation_id = match (&req.conversation_id, &req.channel) {
        (Some(id), _) => id.clone(),
        (None, Some(channel)) => match state.memory.get_or_create_open_conversation(channel) {
            Ok(conv) => conv.id,
            Err(e) => {
                warn!(error = %e, "could not resolve an open conversation to close");
                return Json(json!({ "error": e.to_string() }));
            }
        },
        (None, None) => {
            return Json(json!({ "error": "one of conversation_id or channel is required" }))
        }
    };

    let message_count = match state.memory.count_messages(&conversation_id) {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "could not count messages for conversation close");
            return Json(json!({ "error": e.to_string() }));
        }
    };

    match state.memory.close_conversation(
        &conversation_id,
        message_count,
        req.summary.as_deref().unwrap_or(""),
    ) {
        Ok(()) => Json(json!({ "conversation_id": conversation_id, "message_count": message_count })),
        Err(e) => {
            warn!(error = %e, "failed to close conversation");
            Json(json!({ "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    pub channel: String,
}

/// GET /api/conversation/context?channel=... — the open conversation for a
/// channel, for operator inspection; not on the hot path of a turn.
pub async fn context_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContextQuery>,
) -> Json<Value> {
    match state.memory.get_or_create_open_conversation(&query.channel) {
        Ok(conv) => Json(json!({
            "id": conv.id,
            "channel": conv.channel,
            "started_at": conv.started_at,
            "ended_at": conv.ended_at,
            "message_count": conv.message_count,
            "summary": conv.summary,
        })),
        Err(e) => {
            warn!(error = %e, "failed to resolve conversation context");
            Json(json!({ "error": e.to_string() }))
        }
    }
}
