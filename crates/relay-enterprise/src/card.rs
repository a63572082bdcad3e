//! Builds the outbound JSON body for an enterprise chat message/card.
//! Pure function over [`OutboundMessage`] — no I/O, easy to snapshot-test.

use relay_channels::{InlineActionKind, OutboundMessage};
use serde_json::{json, Value};

/// A block-based card: one text section, plus an actions block per
/// `msg.actions` entry when the message carries inline approve/deny
/// controls (a delivered `[CONFIRM: …]` confirmation).
pub fn build_card_payload(msg: &OutboundMessage) -> Value {
    let mut blocks = vec![json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": msg.content },
    })];

    if !msg.actions.is_empty() {
        let elements: Vec<Value> = msg
            .actions
            .iter()
            .map(|action| {
                json!({
                    "type": "button",
                    "text": { "type": "plain_text", "text": action.label },
                    "action_id": action.action_id,
                    "style": match action.kind {
                        InlineActionKind::Approve => "primary",
                        InlineActionKind::Deny => "danger",
                    },
                })
            })
            .collect();
        blocks.push(json!({ "type": "actions", "elements": elements }));
    }

    json!({
        "recipient_id": msg.recipient_id,
        "blocks": blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_channels::InlineAction;

    #[test]
    fn plain_message_has_no_actions_block() {
        let msg = OutboundMessage::text("enterprise", "u1", "hello");
        let payload = build_card_payload(&msg);
        assert_eq!(payload["blocks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn confirmation_message_gets_an_actions_block() {
        let mut msg = OutboundMessage::text("enterprise", "u1", "Delete the file?");
        msg.actions.push(InlineAction {
            action_id: "confirm-1".to_string(),
            label: "Approve".to_string(),
            kind: InlineActionKind::Approve,
        });
        msg.actions.push(InlineAction {
            action_id: "confirm-1".to_string(),
            label: "Deny".to_string(),
            kind: InlineActionKind::Deny,
        });
        let payload = build_card_payload(&msg);
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["elements"].as_array().unwrap().len(), 2);
    }
}
