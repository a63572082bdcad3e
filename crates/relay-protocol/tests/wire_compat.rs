// Verify the browser chat websocket wire format stays stable across changes.

use relay_protocol::frames::{EventFrame, InboundFrame, ResFrame};
use relay_protocol::handshake::{AuthPayload, ClientPolicy, ConnectParams, HelloOk, ServerInfo};

#[test]
fn req_frame_round_trip() {
    let json = r#"{"type":"req","id":"abc-123","method":"chat.send","params":{"text":"hello"}}"#;
    let frame: InboundFrame = serde_json::from_str(json).unwrap();
    assert_eq!(frame.frame_type, "req");

    let req = frame.as_req().unwrap();
    assert_eq!(req.method, "chat.send");
    assert_eq!(req.id, "abc-123");
}

#[test]
fn res_ok_serialization() {
    let res = ResFrame::ok("req-1", serde_json::json!({"pong": true}));
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""type":"res""#));
    assert!(json.contains(r#""ok":true"#));
    assert!(json.contains(r#""pong":true"#));
    // error field must be absent on success
    assert!(!json.contains(r#""error""#));
}

#[test]
fn res_err_serialization() {
    let res = ResFrame::err("req-2", "AUTH_FAILED", "bad token");
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""ok":false"#));
    assert!(json.contains(r#""AUTH_FAILED""#));
    // payload must be absent on error
    assert!(!json.contains(r#""payload""#));
}

#[test]
fn event_frame_with_seq() {
    let ev = EventFrame::new("tick", serde_json::json!({"ts": 1234567890})).with_seq(42);
    let json = serde_json::to_string(&ev).unwrap();

    assert!(json.contains(r#""type":"event""#));
    assert!(json.contains(r#""event":"tick""#));
    assert!(json.contains(r#""seq":42"#));
}

#[test]
fn connect_params_token_auth() {
    let json = r#"{"auth":{"token":"secret-123"}}"#;
    let params: ConnectParams = serde_json::from_str(json).unwrap();
    assert_eq!(params.auth.token, "secret-123");
}

#[test]
fn connect_params_optional_client_info() {
    let json = r#"{"auth":{"token":"secret-123"},"client_info":{"name":"web","version":"1.0"}}"#;
    let params: ConnectParams = serde_json::from_str(json).unwrap();
    let info = params.client_info.unwrap();
    assert_eq!(info.name.as_deref(), Some("web"));
}

#[test]
fn hello_ok_protocol_version() {
    let hello = HelloOk {
        protocol: 3,
        server: ServerInfo {
            name: "relay".into(),
            version: "0.1.0".into(),
        },
        policy: ClientPolicy {
            max_message_size: 65_536,
        },
    };
    let json = serde_json::to_string(&hello).unwrap();
    assert!(json.contains(r#""protocol":3"#));
    assert!(json.contains(r#""name":"relay""#));
}

#[test]
fn auth_payload_round_trip() {
    let auth = AuthPayload {
        token: "abc".into(),
    };
    let json = serde_json::to_string(&auth).unwrap();
    let back: AuthPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back.token, "abc");
}

#[test]
fn inbound_frame_rejects_non_req() {
    let json = r#"{"type":"event","event":"tick","payload":{}}"#;
    let frame: InboundFrame = serde_json::from_str(json).unwrap();
    assert!(frame.as_req().is_none(), "event frame must not parse as req");
}
