use std::sync::Arc;

use axum::{extract::State, Json};

use crate::app::AppState;
use relay_dispatcher::types::QueueStatus;

/// GET /queue-status — a human/operator view of the single shared FIFO,
/// mirroring what the WS `queue.status` method returns for a browser client.
pub async fn queue_status_handler(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    Json(state.dispatcher.status())
}
