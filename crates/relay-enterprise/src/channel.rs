use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use relay_channels::{Channel, ChannelError, ChannelStatus, OutboundMessage};
use relay_core::config::EnterpriseChatConfig;
use tracing::{info, warn};

use crate::card::build_card_payload;

/// Outbound-only transport for the enterprise chat integration. Inbound
/// traffic arrives over the webhook endpoint (see [`crate::webhook::parse`])
/// rather than a persistent connection, so `connect`/`disconnect` just flip
/// a status flag — there's no socket to open.
pub struct EnterpriseChannel {
    client: reqwest::Client,
    outgoing_webhook_url: Option<String>,
    connected: AtomicBool,
}

impl EnterpriseChannel {
    pub fn new(config: &EnterpriseChatConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            outgoing_webhook_url: config.outgoing_webhook_url.clone(),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for EnterpriseChannel {
    fn name(&self) -> &str {
        "enterprise"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        if self.outgoing_webhook_url.is_none() {
            warn!("enterprise channel has no outgoing_webhook_url configured — send-only features disabled");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let url = self.outgoing_webhook_url.as_deref().ok_or_else(|| {
            ChannelError::ConfigError("enterprise channel has no outgoing_webhook_url".to_string())
        })?;

        let payload = build_card_payload(msg);
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::SendFailed(format!(
                "enterprise webhook responded with {}",
                response.status()
            )));
        }

        info!(recipient = %msg.recipient_id, "delivered message via enterprise channel");
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        if self.connected.load(Ordering::SeqCst) {
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
    async fn send_without_a_configured_url_fails_fast() {
        let config = EnterpriseChatConfig {
            secret: None,
            auth_mode: relay_core::config::WebhookAuthMode::None,
            outgoing_webhook_url: None,
        };
        let channel = EnterpriseChannel::new(&config);
        let msg = OutboundMessage::text("enterprise", "u1", "hi");
        assert!(channel.send(&msg).await.is_err());
    }

    #[tokio::test]
    async fn connect_and_disconnect_flip_status() {
        let config = EnterpriseChatConfig {
            secret: None,
            auth_mode: relay_core::config::WebhookAuthMode::None,
            outgoing_webhook_url: None,
        };
        let channel = EnterpriseChannel::new(&config);
        assert!(matches!(channel.status(), ChannelStatus::Disconnected));
        channel.connect().await.unwrap();
        assert!(matches!(channel.status(), ChannelStatus::Connected));
        channel.disconnect().await.unwrap();
        assert!(matches!(channel.status(), ChannelStatus::Disconnected));
    }
}
