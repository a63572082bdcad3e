//! `GET /ws/telephony` — the media-stream websocket carrying µ-law audio
//! frames plus call lifecycle events (§6: "telephony media-stream websocket
//! carrying µ-law audio frames plus lifecycle events {connected, start,
//! media, mark, stop}"). Speech transcription and synthesis are external
//! collaborators out of scope here (§1) — this handler only tracks the call
//! lifecycle and, on `stop`, triggers the same consolidation a channel's
//! normal idle timer would (§4.H), so a call that produced conversation
//! history gets summarized promptly instead of waiting out the dispatcher's
//! idle window.

use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::StreamExt;
use relay_protocol::telephony::TelephonyFrame;
use tracing::{info, warn};

use crate::app::AppState;

pub async fn telephony_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_call(socket, state))
}

async fn handle_call(mut socket: WebSocket, state: Arc<AppState>) {
    let mut call_sid: Option<String> = None;
    let mut media_chunks: u64 = 0;

    while let Some(msg) = socket.next().await {
        let Ok(Message::Text(text)) = msg else {
            if matches!(msg, Some(Ok(Message::Close(_))) | None) {
                break;
            }
            continue;
        };

        let frame: TelephonyFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed telephony frame, ignoring");
                continue;
            }
        };

        match frame {
            TelephonyFrame::Connected { protocol } => {
                info!(protocol = %protocol, "telephony stream connected");
            }
            TelephonyFrame::Start { stream_sid, call_sid: sid } => {
                info!(stream_sid = %stream_sid, call_sid = %sid, "telephony call started");
                call_sid = Some(sid);
            }
            TelephonyFrame::Media { media, .. } => {
                media_chunks = media_chunks.max(media.chunk);
            }
            TelephonyFrame::Mark { mark, .. } => {
                info!(mark = %mark.name, "telephony mark acknowledged");
            }
            TelephonyFrame::Stop { stream_sid } => {
                info!(stream_sid = %stream_sid, chunks = media_chunks, "telephony call stopped");
                if let Some(sid) = &call_sid {
                    let channel = format!("telephony:{sid}");
                    let has_history = state
                        .memory
                        .recent_messages(&channel, 1)
                        .map(|rows| !rows.is_empty())
                        .unwrap_or(false);
                    if has_history {
                        if let Err(e) = state.consolidator.run_once(Some(&channel)).await {
                            warn!(channel = %channel, error = %e, "post-call consolidation failed");
                        }
                    }
                }
                break;
            }
        }
    }
}
