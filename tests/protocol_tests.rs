//! Boundary decoding tables and config file loading.

use std::io::Write;

use rstest::rstest;
use serde_json::json;

use wolf_collab::protocol::{decode, EventKind, Inbound, ProtocolError, WireMessage};
use wolf_collab::{AppConfig, CollabError, ManualConnect};

// ---------------------------------------------------------------------------
// Inbound classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Class {
    Message,
    Unknown,
    Invalid,
    Raw,
}

fn classify(inbound: &Inbound) -> Class {
    match inbound {
        Inbound::Message(_) => Class::Message,
        Inbound::Unknown { .. } => Class::Unknown,
        Inbound::Invalid { .. } => Class::Invalid,
        Inbound::Raw(_) => Class::Raw,
    }
}

#[rstest]
#[case::plain_text("hello there", Class::Raw)]
#[case::truncated_json(r#"{"type":"join""#, Class::Raw)]
#[case::empty("", Class::Raw)]
#[case::unknown_type(r#"{"type":"cursor","x":3}"#, Class::Unknown)]
#[case::no_type(r#"{"user":{"id":"a","name":"A"}}"#, Class::Invalid)]
#[case::numeric_type(r#"{"type":7}"#, Class::Invalid)]
#[case::array("[1,2,3]", Class::Invalid)]
#[case::bare_string(r#""join""#, Class::Invalid)]
#[case::join_without_user(r#"{"type":"join","timestamp":"2024-05-01T12:00:00Z"}"#, Class::Invalid)]
#[case::bad_timestamp(
    r#"{"type":"action","user":{"id":"a","name":"A"},"timestamp":"yesterday"}"#,
    Class::Invalid
)]
#[case::roster_request(r#"{"type":"roster_request"}"#, Class::Message)]
#[case::echo_any_payload(r#"{"type":"echo","payload":[1,"two",null]}"#, Class::Message)]
#[case::test_minimal(r#"{"type":"test"}"#, Class::Message)]
#[case::welcome_empty(r#"{"type":"welcome","timestamp":"2024-05-01T12:00:00Z"}"#, Class::Message)]
#[case::presence_extra_fields(
    r#"{"type":"presence","user":{"id":"a","name":"A"},"timestamp":"2024-05-01T12:00:00Z","cursor":{"x":1}}"#,
    Class::Message
)]
fn test_inbound_classification(#[case] text: &str, #[case] expected: Class) {
    assert_eq!(classify(&Inbound::from_text(text)), expected);
}

#[rstest]
#[case("join", EventKind::Join)]
#[case("leave", EventKind::Leave)]
#[case("action", EventKind::Action)]
#[case("message", EventKind::Message)]
#[case("presence", EventKind::Presence)]
#[case("activity", EventKind::Activity)]
fn test_every_event_kind_decodes(#[case] kind: &str, #[case] expected: EventKind) {
    let text = json!({
        "type": kind,
        "user": {"id": "u1", "name": "Ann"},
        "timestamp": "2024-05-01T12:00:00Z",
        "details": "x",
    })
    .to_string();
    let msg = decode(&text).unwrap();
    assert_eq!(msg.kind(), kind);
    assert_eq!(msg.event_kind(), Some(expected));
    let event = msg.collaboration_event().unwrap();
    assert_eq!(event.body.user.name, "Ann");
    assert_eq!(event.body.details.as_deref(), Some("x"));
}

#[test]
fn test_raw_keeps_exact_text() {
    let text = "  spaced \n text ";
    assert_eq!(Inbound::from_text(text), Inbound::Raw(text.to_string()));
}

#[test]
fn test_invalid_reason_names_the_kind() {
    match Inbound::from_text(r#"{"type":"leave","user":null}"#) {
        Inbound::Invalid { reason, payload } => {
            assert!(reason.contains("leave"), "reason: {reason}");
            assert_eq!(payload["type"], "leave");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_error_variants() {
    assert!(matches!(decode("nope"), Err(ProtocolError::NotJson(_))));
    assert_eq!(decode("{}"), Err(ProtocolError::MissingType));
    assert_eq!(
        decode(r#"{"type":"ROSTER"}"#),
        Err(ProtocolError::UnknownType("ROSTER".to_string()))
    );
}

#[test]
fn test_chat_helper_puts_text_in_details() {
    let msg = WireMessage::chat(wolf_collab::protocol::UserRef::new("a", "A"), "hi");
    let v = serde_json::to_value(&msg).unwrap();
    assert_eq!(v["type"], "message");
    assert_eq!(v["details"], "hi");
    assert!(v["timestamp"].is_string());
}

// ---------------------------------------------------------------------------
// Config files
// ---------------------------------------------------------------------------

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
port = 9100
roster_interval_secs = 5

[client]
url = "wss://collab.example.com/ws"
event_log_capacity = 50

[client.reconnect]
interval_ms = 1500
manual_connect = "honor_cap"
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.server.port, 9100);
    assert_eq!(config.server.ws_path, "/ws");
    assert_eq!(config.server.roster_interval_secs, 5);
    assert_eq!(config.client.url, "wss://collab.example.com/ws");
    assert_eq!(config.client.event_log_capacity, 50);
    assert_eq!(config.client.reconnect.interval_ms, 1500);
    assert_eq!(config.client.reconnect.max_attempts, 5);
    assert_eq!(config.client.reconnect.manual_connect, ManualConnect::HonorCap);
}

#[test]
fn test_load_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, CollabError::Io(_)));
}

#[test]
fn test_load_rejects_bad_endpoint() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[client]\nurl = \"http://not-a-socket\"").unwrap();
    let err = AppConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, CollabError::InvalidEndpoint(_)));
}
