use relay_core::config::GatewayConfig;
use relay_protocol::{
    frames::EventFrame,
    handshake::{ClientPolicy, ConnectChallenge, ConnectParams, HelloOk, ServerInfo},
};
use uuid::Uuid;

/// Maximum browser-chat frame size advertised to clients in `hello-ok`.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Random nonce for the connect challenge.
pub fn make_nonce() -> String {
    Uuid::new_v4().to_string().replace('-', "")
}

/// Serialize the `connect.challenge` event that opens every WS session.
pub fn challenge_event(nonce: &str) -> String {
    let frame = EventFrame::new(
        "connect.challenge",
        ConnectChallenge {
            nonce: nonce.to_string(),
        },
    );
    serde_json::to_string(&frame).expect("challenge serialization is infallible")
}

/// Verify the client's `connect` auth payload against the configured
/// gateway token. A `None` `auth_token` trusts any (or no) token, for
/// trusted-network-only deployments.
pub fn verify_auth(params: &ConnectParams, config: &GatewayConfig) -> Result<(), String> {
    match &config.auth_token {
        None => Ok(()),
        Some(expected) => {
            if &params.auth.token == expected {
                Ok(())
            } else {
                Err("invalid token".to_string())
            }
        }
    }
}

/// Build the `hello-ok` response payload after successful authentication.
pub fn hello_ok_payload() -> HelloOk {
    HelloOk {
        protocol: 1,
        server: ServerInfo {
            name: "relay-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        policy: ClientPolicy {
            max_message_size: MAX_MESSAGE_SIZE,
        },
    }
}
