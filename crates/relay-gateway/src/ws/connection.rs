use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use relay_channels::InboundMessage;
use relay_protocol::{
    frames::{EventFrame, InboundFrame, ResFrame},
    handshake::ConnectParams,
    methods::{CHAT_ABORT, CHAT_SEND, CONNECT, QUEUE_STATUS},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::channel::WebChatEvent;
use crate::ws::handshake;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// WS connection state machine.
///
/// AwaitingConnect → Authenticated → (runs until close) → Closing.
/// Handshake must complete within `HANDSHAKE_TIMEOUT` or the connection drops.
enum ConnState {
    AwaitingConnect,
    Authenticated,
    Closing,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — lives for the entire WS session lifetime. Registers
/// with the [`crate::ws::channel::WebChatChannel`] only once the handshake
/// completes, so an unauthenticated socket can never receive pushed turns.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new browser chat connection");

    let (mut tx, mut rx) = socket.split();

    let nonce = handshake::make_nonce();
    let challenge_json = handshake::challenge_event(&nonce);
    if tx.send(Message::Text(challenge_json.into())).await.is_err() {
        return;
    }

    let mut conn_state = ConnState::AwaitingConnect;
    let mut events: Option<tokio::sync::mpsc::UnboundedReceiver<WebChatEvent>> = None;

    let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    let mut handshake_timer = Box::pin(tokio::time::sleep_until(handshake_deadline));

    let mut tick_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id, size = text_ref.len(), "payload too large, dropping connection");
                            break;
                        }
                        conn_state = process_message(&conn_id, text_ref, conn_state, &mut tx, &state, &mut events).await;
                        if matches!(conn_state, ConnState::Closing) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            event = recv_optional(&mut events) => {
                match event {
                    Some(WebChatEvent::Message(outbound)) => {
                        seq += 1;
                        let frame = EventFrame::new("chat.message", serde_json::json!({
                            "content": outbound.content,
                            "format": outbound.format,
                            "actions": outbound.actions,
                        })).with_seq(seq);
                        if send_json(&mut tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(WebChatEvent::Typing) => {
                        seq += 1;
                        let frame = EventFrame::new("chat.typing", serde_json::json!({})).with_seq(seq);
                        if send_json(&mut tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }

            _ = tick_interval.tick() => {
                if matches!(conn_state, ConnState::Authenticated) {
                    seq += 1;
                    let tick = EventFrame::new("tick", serde_json::json!({
                        "ts": chrono::Utc::now().timestamp_millis(),
                    })).with_seq(seq);
                    if send_json(&mut tx, &tick).await.is_err() {
                        break;
                    }
                }
            }

            _ = &mut handshake_timer => {
                if matches!(conn_state, ConnState::AwaitingConnect) {
                    warn!(conn_id, "handshake timeout, closing connection");
                    break;
                }
            }
        }
    }

    state.webchat.unregister(&conn_id);
    info!(conn_id, "browser chat connection closed");
}

/// Awaits on `rx` if present, otherwise never resolves — lets the same
/// `tokio::select!` arm be used before and after a connection registers.
async fn recv_optional(rx: &mut Option<tokio::sync::mpsc::UnboundedReceiver<WebChatEvent>>) -> Option<WebChatEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a single inbound text frame. Returns the new connection state.
async fn process_message(
    conn_id: &str,
    text: &str,
    state: ConnState,
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    app: &Arc<AppState>,
    events: &mut Option<tokio::sync::mpsc::UnboundedReceiver<WebChatEvent>>,
) -> ConnState {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed frame, ignoring");
            return state;
        }
    };

    match state {
        ConnState::AwaitingConnect => {
            let Some(req) = frame.as_req() else {
                return state;
            };

            if req.method != CONNECT {
                let res = ResFrame::err(&req.id, "PROTOCOL_ERROR", "must authenticate first");
                let _ = send_json(tx, &res).await;
                return state;
            }

            let params: ConnectParams = match req.params.and_then(|p| serde_json::from_value(p).ok()) {
                Some(p) => p,
                None => {
                    let res = ResFrame::err(&req.id, "PROTOCOL_ERROR", "invalid connect params");
                    let _ = send_json(tx, &res).await;
                    return ConnState::Closing;
                }
            };

            match handshake::verify_auth(&params, &app.config.gateway) {
                Ok(()) => {
                    let hello = handshake::hello_ok_payload();
                    let res = ResFrame::ok(&req.id, hello);
                    let _ = send_json(tx, &res).await;
                    *events = Some(app.webchat.register(conn_id.to_string()));
                    info!(conn_id, "browser chat connection authenticated");
                    ConnState::Authenticated
                }
                Err(reason) => {
                    warn!(conn_id, %reason, "browser chat auth failed");
                    let res = ResFrame::err(&req.id, "AUTH_FAILED", &reason);
                    let _ = send_json(tx, &res).await;
                    ConnState::Closing
                }
            }
        }

        ConnState::Authenticated => {
            if let Some(req) = frame.as_req() {
                let res = dispatch_method(&req.method, req.params.as_ref(), &req.id, conn_id, app);
                let _ = send_json(tx, &res).await;
            }
            ConnState::Authenticated
        }

        ConnState::Closing => ConnState::Closing,
    }
}

#[derive(Debug, Deserialize)]
struct ChatSendParams {
    content: String,
    #[serde(default)]
    sender_name: Option<String>,
}

/// Route one authenticated method call. Unlike the synchronous webhook path,
/// `chat.send` only enqueues onto the Dispatcher — the reply itself arrives
/// later as a `chat.message` event once the Response Pipeline completes.
fn dispatch_method(
    method: &str,
    params: Option<&serde_json::Value>,
    req_id: &str,
    conn_id: &str,
    app: &Arc<AppState>,
) -> ResFrame {
    match method {
        CHAT_SEND => {
            let Some(params) = params.cloned().and_then(|p| serde_json::from_value::<ChatSendParams>(p).ok()) else {
                return ResFrame::err(req_id, "PROTOCOL_ERROR", "invalid chat.send params");
            };
            let inbound = InboundMessage {
                channel: "webchat".to_string(),
                sender_id: conn_id.to_string(),
                sender_name: params.sender_name,
                content: params.content,
                timestamp: chrono::Utc::now().to_rfc3339(),
                raw_payload: None,
            };
            app.dispatcher.enqueue("webchat", inbound);
            ResFrame::ok(req_id, serde_json::json!({ "queued": true }))
        }

        // The shared FIFO has no per-item cancellation once a turn is
        // dispatched, and the Model Gateway's only interrupt path is its own
        // timeout-driven SIGTERM/SIGKILL escalation — so an abort request is
        // acknowledged but does not interrupt a turn already in flight.
        CHAT_ABORT => ResFrame::ok(req_id, serde_json::json!({ "aborted": false })),

        QUEUE_STATUS => ResFrame::ok(req_id, app.dispatcher.status()),

        _ => ResFrame::err(
            req_id,
            "METHOD_NOT_FOUND",
            &format!("method '{method}' not recognized"),
        ),
    }
}

/// Serialize and send a frame over the WS sink.
async fn send_json<T: serde::Serialize>(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    payload: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(payload).unwrap_or_default();
    tx.send(Message::Text(json.into())).await.map_err(axum::Error::new)
}
