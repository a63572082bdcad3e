//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event
//! loop on a background task for as long as the channel stays connected.
//! Inbound updates are handed to `handler::handle_message`, which forwards
//! them into the shared `relay_dispatcher::Dispatcher` queue instead of
//! invoking the model directly — the channel adapter's only job is
//! transport: Telegram update in, `InboundMessage` out; `OutboundMessage` in,
//! Telegram API call out.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teloxide::prelude::*;
use tokio::task::JoinHandle;
use tracing::info;

use relay_channels::channel::Channel;
use relay_channels::error::ChannelError;
use relay_channels::types::{ChannelStatus, OutboundMessage};
use relay_core::config::ChatBotConfig;
use relay_dispatcher::Dispatcher;

use crate::handler::handle_message;

/// Telegram channel adapter (`relay_channels::Channel` impl).
///
/// Long polling — no public URL required. `connect` spawns the teloxide
/// dispatch loop as a background task; `disconnect` aborts it.
pub struct TelegramChannel {
    config: ChatBotConfig,
    dispatcher: Arc<Dispatcher>,
    bot: Mutex<Option<Bot>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    status: Mutex<ChannelStatus>,
}

impl TelegramChannel {
    pub fn new(config: ChatBotConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            bot: Mutex::new(None),
            run_handle: Mutex::new(None),
            status: Mutex::new(ChannelStatus::Disconnected),
        }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "chatbot"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        if self.config.bot_token.is_empty() {
            let msg = "no bot token configured".to_string();
            *self.status.lock().unwrap() = ChannelStatus::Error(msg.clone());
            return Err(ChannelError::ConnectionFailed(msg));
        }

        let bot = Bot::new(&self.config.bot_token);
        info!("telegram: starting long-polling dispatcher");

        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let handler = Update::filter_message().endpoint(handle_message);
        let bot_for_loop = bot.clone();

        let handle = tokio::spawn(async move {
            teloxide::dispatching::Dispatcher::builder(bot_for_loop, handler)
                .dependencies(dptree::deps![dispatcher, config])
                .default_handler(|_upd| async {})
                .build()
                .dispatch()
                .await;
        });

        *self.bot.lock().unwrap() = Some(bot);
        *self.run_handle.lock().unwrap() = Some(handle);
        *self.status.lock().unwrap() = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        if let Some(handle) = self.run_handle.lock().unwrap().take() {
            handle.abort();
        }
        *self.bot.lock().unwrap() = None;
        *self.status.lock().unwrap() = ChannelStatus::Disconnected;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let bot = self
            .bot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChannelError::ConnectionFailed("telegram channel not connected".to_string()))?;
        let chat_id: i64 = msg
            .recipient_id
            .parse()
            .map_err(|_| ChannelError::SendFailed(format!("invalid telegram chat id: {}", msg.recipient_id)))?;
        crate::send::send_response(&bot, ChatId(chat_id), &msg.content).await;
        Ok(())
    }

    async fn send_typing(&self, recipient_id: &str) -> Result<(), ChannelError> {
        let bot = match self.bot.lock().unwrap().clone() {
            Some(bot) => bot,
            None => return Ok(()),
        };
        let chat_id: i64 = recipient_id
            .parse()
            .map_err(|_| ChannelError::SendFailed(format!("invalid telegram chat id: {recipient_id}")))?;
        let _ = bot
            .send_chat_action(ChatId(chat_id), teloxide::types::ChatAction::Typing)
            .await;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.lock().unwrap().clone()
    }
}
