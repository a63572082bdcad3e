//! Telegram message handler registered in the teloxide `Dispatcher`.

use std::sync::Arc;

use chrono::Utc;
use teloxide::prelude::*;

use relay_channels::types::InboundMessage;
use relay_core::config::ChatBotConfig;
use relay_dispatcher::Dispatcher;

use crate::allow;
use crate::attach;

/// Main message handler registered in the teloxide Dispatcher.
///
/// Runs for every incoming `Message`. Performs:
/// 1. Bot-message filter
/// 2. Allowlist check (deny-by-default)
/// 3. DM guard
/// 4. `require_mention` guard for groups
/// 5. Media extraction
/// 6. Enqueue onto the shared dispatcher
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    dispatcher: Arc<Dispatcher>,
    config: ChatBotConfig,
) -> ResponseResult<()> {
    // 1. Ignore messages from other bots.
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }

    // 2. Extract sender identity.
    let from = match msg.from.as_ref() {
        Some(u) => u,
        None => return Ok(()),
    };
    let username = from.username.as_deref().unwrap_or("");
    let telegram_user_id = from.id.0.to_string();

    // 3. Allowlist check (deny-by-default).
    if !allow::is_allowed(&config.allow_users, username, &telegram_user_id) {
        return Ok(());
    }

    // 4. DM guard.
    if msg.chat.is_private() && !config.dm_allowed {
        return Ok(());
    }

    // 5. require_mention guard for group/supergroup.
    if (msg.chat.is_group() || msg.chat.is_supergroup()) && config.require_mention {
        let bot_info = bot.get_me().await;
        let bot_username = bot_info
            .as_ref()
            .ok()
            .and_then(|me| me.user.username.as_deref())
            .unwrap_or("");
        let text_for_mention = msg.text().or(msg.caption()).unwrap_or("");
        if !contains_mention(text_for_mention, bot_username) {
            return Ok(());
        }
    }

    // 6. Extract text content (or caption for media messages).
    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    let has_media = msg.photo().is_some()
        || msg.document().is_some()
        || msg.video().is_some()
        || msg.audio().is_some()
        || msg.voice().is_some()
        || msg.sticker().is_some();

    if text.is_empty() && !has_media {
        return Ok(());
    }

    let attachments = attach::extract_media(&bot, &msg, config.max_attachment_bytes).await;
    let raw_payload = build_raw_payload(&msg, attachments);

    let content = if text.is_empty() {
        "[User sent attachment(s)]".to_string()
    } else {
        text
    };

    // `sender_id` is the raw Telegram chat id so `TelegramChannel::send` can
    // address a reply back to the same chat without a lookup table — forum
    // topic thread id, if any, travels in `raw_payload` instead.
    let inbound = InboundMessage {
        channel: "chatbot".to_string(),
        sender_id: msg.chat.id.0.to_string(),
        sender_name: from.username.clone().or_else(|| Some(from.first_name.clone())),
        content,
        timestamp: Utc::now().to_rfc3339(),
        raw_payload,
    };

    dispatcher.enqueue("chatbot", inbound);
    Ok(())
}

fn build_raw_payload(msg: &Message, attachments: Option<Vec<serde_json::Value>>) -> Option<serde_json::Value> {
    if attachments.is_none() && msg.thread_id.is_none() {
        return None;
    }
    Some(serde_json::json!({
        "attachments": attachments.unwrap_or_default(),
        "thread_id": msg.thread_id.map(|t| t.0),
    }))
}

/// Return `true` if `text` contains a `@bot_username` mention.
fn contains_mention(text: &str, bot_username: &str) -> bool {
    if bot_username.is_empty() {
        return false;
    }
    let mention = format!("@{bot_username}");
    text.contains(&mention)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_mention_positive() {
        assert!(contains_mention("Hey @mybot, help!", "mybot"));
    }

    #[test]
    fn contains_mention_negative() {
        assert!(!contains_mention("Hello there", "mybot"));
    }

    #[test]
    fn contains_mention_empty_username() {
        assert!(!contains_mention("@foo bar", ""));
    }
}
