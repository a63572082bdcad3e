//! Parses an already-authenticated enterprise chat webhook body into
//! either a plain message (forwarded into the Dispatcher as an
//! [`InboundMessage`]) or a card-button callback (resolved against the
//! Approval Store by the caller — this crate has no opinion on approval
//! semantics, only on the wire shape).

use relay_channels::InboundMessage;
use serde::Deserialize;

use crate::error::{EnterpriseError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Message {
        user_id: String,
        #[serde(default)]
        user_name: Option<String>,
        text: String,
        ts: String,
    },
    BlockActions {
        user_id: String,
        action_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardAction {
    pub action_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub enum EnterpriseWebhookEvent {
    Message(InboundMessage),
    Action(CardAction),
}

/// `channel_name` is the logical channel this event is attributed to
/// (e.g. `"enterprise"`) — the same name the [`crate::channel::EnterpriseChannel`]
/// was registered under.
pub fn parse(channel_name: &str, body: &[u8]) -> Result<EnterpriseWebhookEvent> {
    let event: WireEvent = serde_json::from_slice(body)
        .map_err(|e| EnterpriseError::InvalidPayload(e.to_string()))?;

    Ok(match event {
        WireEvent::Message {
            user_id,
            user_name,
            text,
            ts,
        } => EnterpriseWebhookEvent::Message(InboundMessage {
            channel: channel_name.to_string(),
            sender_id: user_id,
            sender_name: user_name,
            content: text,
            timestamp: ts,
            raw_payload: serde_json::from_slice(body).ok(),
        }),
        WireEvent::BlockActions { user_id, action_id } => {
            EnterpriseWebhookEvent::Action(CardAction { action_id, user_id })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_message_event() {
        let body = br#"{"type":"message","user_id":"u1","user_name":"Alice","text":"hi","ts":"2026-07-28T00:00:00Z"}"#;
        match parse("enterprise", body).unwrap() {
            EnterpriseWebhookEvent::Message(msg) => {
                assert_eq!(msg.sender_id, "u1");
                assert_eq!(msg.content, "hi");
                assert_eq!(msg.channel, "enterprise");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_block_action_event() {
        let body = br#"{"type":"block_actions","user_id":"u2","action_id":"confirm-7"}"#;
        match parse("enterprise", body).unwrap() {
            EnterpriseWebhookEvent::Action(action) => {
                assert_eq!(action.action_id, "confirm-7");
                assert_eq!(action.user_id, "u2");
            }
            other => panic!("expected Action, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse("enterprise", b"not json").is_err());
    }
}
