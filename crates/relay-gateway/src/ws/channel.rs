//! Browser chat channel (`relay_channels::Channel` impl) backing the `/ws`
//! endpoint (§6: "a websocket for a browser chat with optional image
//! attachments"). Unlike the Telegram/enterprise adapters this one has no
//! external service to dial — "connected" just means at least one browser
//! tab currently has the socket open. Outbound sends and typing heartbeats
//! are routed to whichever connection registered under `recipient_id`
//! (the connection's own id, handed out at `connect.challenge` time and
//! used as the `InboundMessage::sender_id` for everything that connection
//! sends).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use relay_channels::{Channel, ChannelError, ChannelStatus, OutboundMessage};

/// Pushed to a connection's forwarding task; mirrors the two things the
/// Dispatcher ever asks a channel to do for a single turn (§4.E).
pub enum WebChatEvent {
    Message(OutboundMessage),
    Typing,
}

pub struct WebChatChannel {
    senders: DashMap<String, mpsc::UnboundedSender<WebChatEvent>>,
    any_connected: AtomicBool,
}

impl WebChatChannel {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            any_connected: AtomicBool::new(false),
        }
    }

    /// Register a freshly authenticated connection. Returns the receiving
    /// half the connection task should forward onto the socket.
    pub fn register(&self, conn_id: String) -> mpsc::UnboundedReceiver<WebChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(conn_id, tx);
        self.any_connected.store(true, Ordering::SeqCst);
        rx
    }

    pub fn unregister(&self, conn_id: &str) {
        self.senders.remove(conn_id);
        self.any_connected
            .store(!self.senders.is_empty(), Ordering::SeqCst);
    }
}

impl Default for WebChatChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for WebChatChannel {
    fn name(&self) -> &str {
        "webchat"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.senders.clear();
        self.any_connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let sender = self.senders.get(&msg.recipient_id).ok_or_else(|| {
            ChannelError::SendFailed(format!(
                "no open browser chat connection for {}",
                msg.recipient_id
            ))
        })?;
        sender
            .send(WebChatEvent::Message(msg.clone()))
            .map_err(|_| ChannelError::SendFailed("browser chat connection closed".to_string()))
    }

    async fn send_typing(&self, recipient_id: &str) -> Result<(), ChannelError> {
        if let Some(sender) = self.senders.get(recipient_id) {
            let _ = sender.send(WebChatEvent::Typing);
        }
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        if self.any_connected.load(Ordering::SeqCst) {
            ChannelStatus::Connected
        } else {
            ChannelStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_the_registered_connection() {
        let channel = WebChatChannel::new();
        let mut rx = channel.register("conn-1".to_string());
        let msg = OutboundMessage::text("webchat", "conn-1", "hi");
        channel.send(&msg).await.unwrap();
        match rx.recv().await.unwrap() {
            WebChatEvent::Message(m) => assert_eq!(m.content, "hi"),
            WebChatEvent::Typing => panic!("expected a message event"),
        }
    }

    #[tokio::test]
    async fn send_to_an_unregistered_connection_fails() {
        let channel = WebChatChannel::new();
        let msg = OutboundMessage::text("webchat", "ghost", "hi");
        assert!(channel.send(&msg).await.is_err());
    }

    #[tokio::test]
    async fn status_reflects_registration() {
        let channel = WebChatChannel::new();
        assert!(matches!(channel.status(), ChannelStatus::Disconnected));
        let _rx = channel.register("conn-1".to_string());
        assert!(matches!(channel.status(), ChannelStatus::Connected));
        channel.unregister("conn-1");
        assert!(matches!(channel.status(), ChannelStatus::Disconnected));
    }
}
