use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024;
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Top-level configuration (`relay.toml` + `RELAY_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub consolidator: ConsolidatorConfig,
    #[serde(default)]
    pub retry_queue: RetryQueueConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            model: ModelConfig::default(),
            dispatcher: DispatcherConfig::default(),
            delivery: DeliveryConfig::default(),
            consolidator: ConsolidatorConfig::default(),
            retry_queue: RetryQueueConfig::default(),
            webhook: WebhookConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token the browser WS `connect` handshake must present. `None`
    /// accepts any (or no) token — the deployment is trusted-network-only.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_lock_path")]
    pub lock_path: String,
    #[serde(default = "default_session_path")]
    pub session_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            lock_path: default_lock_path(),
            session_path: default_session_path(),
        }
    }
}

/// Model Gateway (§4.D) configuration — the external LLM is always invoked
/// as a subprocess; there is no hosted-provider configuration here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path (or bare name resolved via `$PATH`) to the model CLI binary.
    #[serde(default = "default_claude_path")]
    pub claude_path: String,
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Timeout when tools are allowed for this invocation (ms).
    #[serde(default = "default_model_timeout_with_tools_ms")]
    pub timeout_with_tools_ms: u64,
    /// Timeout when no tools are allowed (ms) — a much tighter bound.
    #[serde(default = "default_model_timeout_without_tools_ms")]
    pub timeout_without_tools_ms: u64,
    /// Grace period between SIGTERM and SIGKILL during escalated termination.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Out-of-band lock duration armed after a timeout to suppress dependent
    /// side effects while the subprocess's state is uncertain.
    #[serde(default = "default_recovery_lock_ms")]
    pub recovery_lock_ms: u64,
    #[serde(default = "default_timezone")]
    pub user_timezone: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            claude_path: default_claude_path(),
            model: default_model_name(),
            timeout_with_tools_ms: default_model_timeout_with_tools_ms(),
            timeout_without_tools_ms: default_model_timeout_without_tools_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            recovery_lock_ms: default_recovery_lock_ms(),
            user_timezone: default_timezone(),
        }
    }
}

/// Channel Dispatcher (§4.E) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_typing_interval_ms")]
    pub typing_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_idle_ms(),
            typing_interval_ms: default_typing_interval_ms(),
        }
    }
}

/// Delivery Engine (§4.C) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_nudge_delay_ms")]
    pub nudge_delay_ms: u64,
    #[serde(default = "default_nudge_check_interval_ms")]
    pub nudge_check_interval_ms: u64,
    #[serde(default = "default_nudge_gc_ms")]
    pub nudge_gc_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            nudge_delay_ms: default_nudge_delay_ms(),
            nudge_check_interval_ms: default_nudge_check_interval_ms(),
            nudge_gc_ms: default_nudge_gc_ms(),
        }
    }
}

/// Consolidator (§4.H) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatorConfig {
    #[serde(default = "default_consolidation_batch_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_block_gap_ms")]
    pub block_gap_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_consolidation_batch_ms(),
            block_gap_ms: default_block_gap_ms(),
            batch_size: default_batch_size(),
        }
    }
}

/// Retry Queue (§4.J) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    #[serde(default = "default_retry_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_queue_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_retry_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_purge_age_days")]
    pub purge_completed_after_days: u32,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_retry_poll_ms(),
            batch_size: default_retry_queue_batch_size(),
            default_max_attempts: default_retry_max_attempts(),
            purge_completed_after_days: default_purge_age_days(),
        }
    }
}

/// Webhook Race Coordinator (§4.K) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_webhook_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub chatbot: Option<ChatBotConfig>,
    pub enterprise: Option<EnterpriseChatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBotConfig {
    pub bot_token: String,
    /// Usernames (with or without a leading `@`) or numeric user IDs allowed
    /// to use the bot. Empty means deny-by-default; `"*"` allows everyone.
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// In group chats, only respond when the bot is actually mentioned.
    /// Direct messages are never subject to this gate.
    #[serde(default = "default_require_mention")]
    pub require_mention: bool,
    /// Whether the bot responds to direct messages at all.
    #[serde(default = "default_dm_allowed")]
    pub dm_allowed: bool,
    /// Largest inbound attachment, in bytes, the channel will download.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

fn default_require_mention() -> bool {
    true
}

fn default_dm_allowed() -> bool {
    true
}

fn default_max_attachment_bytes() -> u64 {
    20 * 1024 * 1024
}

/// Authentication mode for the enterprise chat webhook and the voice-assistant webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    HmacSha256,
    BearerToken,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnterpriseChatConfig {
    pub secret: Option<String>,
    pub auth_mode: WebhookAuthMode,
    /// Where outbound messages/cards are POSTed. `None` disables sending —
    /// the channel still accepts inbound webhook callbacks.
    #[serde(default)]
    pub outgoing_webhook_url: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_claude_path() -> String {
    std::env::var("CLAUDE_PATH").unwrap_or_else(|_| "claude".to_string())
}
fn default_model_name() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_timezone() -> String {
    std::env::var("USER_TIMEZONE").unwrap_or_else(|_| "UTC".to_string())
}
fn default_model_timeout_with_tools_ms() -> u64 {
    420_000
}
fn default_model_timeout_without_tools_ms() -> u64 {
    60_000
}
fn default_kill_grace_ms() -> u64 {
    5_000
}
fn default_recovery_lock_ms() -> u64 {
    60_000
}
fn default_idle_ms() -> u64 {
    600_000
}
fn default_typing_interval_ms() -> u64 {
    4_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    2_000
}
fn default_nudge_delay_ms() -> u64 {
    300_000
}
fn default_nudge_check_interval_ms() -> u64 {
    60_000
}
fn default_nudge_gc_ms() -> u64 {
    3_600_000
}
fn default_consolidation_batch_ms() -> u64 {
    4 * 60 * 60 * 1000
}
fn default_block_gap_ms() -> u64 {
    30 * 60 * 1000
}
fn default_batch_size() -> u32 {
    50
}
fn default_retry_poll_ms() -> u64 {
    30_000
}
fn default_retry_queue_batch_size() -> u32 {
    10
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_purge_age_days() -> u32 {
    7
}
fn default_webhook_deadline_ms() -> u64 {
    25_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.relay/relay.db")
}
fn default_lock_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.relay/bot.lock")
}
fn default_session_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.relay/session.json")
}

impl RelayConfig {
    /// Load config from a TOML file with `RELAY_*` env var overrides.
    ///
    /// Checked in order: explicit path argument, then `~/.relay/relay.toml`.
    /// Unknown environment variables are ignored by Figment; missing
    /// required fields fail fast with a human-readable message.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RelayConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAY_").split("_"))
            .extract()
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.relay/relay.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.dispatcher.idle_ms, 600_000);
        assert_eq!(cfg.model.timeout_with_tools_ms, 420_000);
        assert_eq!(cfg.model.timeout_without_tools_ms, 60_000);
        assert_eq!(cfg.delivery.max_retries, 3);
        assert_eq!(cfg.delivery.nudge_delay_ms, 300_000);
        assert_eq!(cfg.retry_queue.poll_interval_ms, 30_000);
        assert_eq!(cfg.webhook.deadline_ms, 25_000);
    }
}
