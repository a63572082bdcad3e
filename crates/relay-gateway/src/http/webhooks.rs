//! `POST /webhooks/{source}` — synchronous webhook entry points for
//! transports that cannot hold a long-lived connection: an enterprise chat
//! integration delivering messages and card-button callbacks, and a
//! voice-assistant intent/slots webhook. Both race the Response Pipeline
//! against `WebhookConfig::deadline_ms` through [`relay_webhook::WebhookCoordinator`]
//! (§4.K) rather than blocking the HTTP response on a full model turn.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use relay_channels::InboundMessage;
use relay_core::types::PendingActionId;
use relay_enterprise::webhook::{CardAction, EnterpriseWebhookEvent};
use relay_retryqueue::NewRetryItem;

use crate::app::AppState;

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    match source.as_str() {
        "enterprise" => handle_enterprise(state, headers, body).await,
        "voice-assistant" => handle_voice_assistant(state, body).await,
        other => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown webhook source: {other}") })),
        ),
    }
}

async fn handle_enterprise(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(enterprise_cfg) = &state.config.channels.enterprise else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "enterprise channel is not configured" })),
        );
    };

    let signature = header_str(&headers, "x-hub-signature-256");
    let authorization = header_str(&headers, "authorization");
    if let Err(e) = relay_enterprise::auth::verify(
        &enterprise_cfg.auth_mode,
        enterprise_cfg.secret.as_deref(),
        signature,
        authorization,
        &body,
    ) {
        warn!(error = %e, "enterprise webhook auth failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "signature verification failed" })),
        );
    }

    let event = match relay_enterprise::webhook::parse("enterprise", &body) {
        Ok(event) => event,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    };

    match event {
        EnterpriseWebhookEvent::Message(inbound) => {
            let reply = state.webhook.handle(state.pipeline.clone(), inbound).await;
            (
                StatusCode::OK,
                Json(json!({
                    "text": reply.text,
                    "confirmations_delivered": reply.confirmations_delivered,
                    "deferred": reply.deferred,
                })),
            )
        }
        EnterpriseWebhookEvent::Action(action) => resolve_card_action(state, action).await,
    }
}

/// Card button `action_id`s carry an explicit `:approve`/`:deny` suffix over
/// the shared `PendingAction` id (see `relay_model::pipeline::process`,
/// which mints both handles off the same confirmation) since that is the
/// only field a button callback round-trips back to us.
async fn resolve_card_action(state: Arc<AppState>, action: CardAction) -> (StatusCode, Json<Value>) {
    let (raw_id, approved) = match action.action_id.rsplit_once(':') {
        Some((id, "approve")) => (id, true),
        Some((id, "deny")) => (id, false),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "malformed action_id" })),
            )
        }
    };

    let id = PendingActionId::from(raw_id.to_string());
    let pending = match state.approvals.remove(&id) {
        Ok(pending) => pending,
        Err(e) => return (StatusCode::GONE, Json(json!({ "error": e.to_string() }))),
    };

    if approved {
        let enqueued = state.retry_queue.enqueue(NewRetryItem {
            action: pending.description.clone(),
            target_id: None,
            payload: json!({
                "agent": pending.agent,
                "channel": pending.channel,
                "approved_by": action.user_id,
            }),
            ..NewRetryItem::default()
        });
        if let Err(e) = enqueued {
            warn!(error = %e, "failed to enqueue approved action for retry-backed execution");
        }
    }

    let text = if approved {
        format!("Approved: {}", pending.description)
    } else {
        format!("Denied: {}", pending.description)
    };
    let msg = relay_channels::OutboundMessage::text(
        pending.transport_handle.channel,
        pending.transport_handle.recipient_id,
        text,
    );
    if let Err(e) = state
        .delivery
        .deliver(msg, &relay_delivery::types::DeliveryOptions::default())
        .await
    {
        warn!(error = %e, "failed to deliver approve/deny acknowledgement");
    }

    (
        StatusCode::OK,
        Json(json!({ "approved": approved, "description": pending.description })),
    )
}

#[derive(Debug, Deserialize)]
struct VoiceAssistantRequest {
    session_id: String,
    intent: String,
    #[serde(default)]
    slots: Value,
}

async fn handle_voice_assistant(state: Arc<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let req: VoiceAssistantRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    };

    let content = format!("intent: {} slots: {}", req.intent, req.slots);
    let inbound = InboundMessage {
        channel: "voice-assistant".to_string(),
        sender_id: req.session_id,
        sender_name: None,
        content,
        timestamp: chrono::Utc::now().to_rfc3339(),
        raw_payload: serde_json::from_slice(&body).ok(),
    };

    let reply = state.webhook.handle(state.pipeline.clone(), inbound).await;
    (
        StatusCode::OK,
        Json(json!({
            "text": reply.text,
            "confirmations_delivered": reply.confirmations_delivered,
            "deferred": reply.deferred,
        })),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
