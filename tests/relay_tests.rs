//! End-to-end tests for the relay: real TCP, real WebSocket handshakes.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wolf_collab::presence::CollabState;
use wolf_collab::protocol::{decode, Inbound, UserRef, WireMessage};
use wolf_collab::relay::{self, HubStore};
use wolf_collab::{server, ClientConfig, ConnectionManager, ServerConfig, Session, SessionEvent};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Relay {
    addr: SocketAddr,
    hub: HubStore,
    _stop: oneshot::Sender<()>,
}

async fn start_relay(roster_interval_secs: u64) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        roster_interval_secs,
        ..ServerConfig::default()
    };
    let hub = relay::new_hub(config.broadcast_capacity);
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server::run(listener, config, hub.clone(), async move {
        let _ = stopped.await;
    }));
    Relay {
        addr,
        hub,
        _stop: stop,
    }
}

async fn dial(addr: SocketAddr, query: &str) -> Ws {
    let url = format!("ws://{addr}/ws?{query}");
    let (ws, _) = tokio::time::timeout(WAIT, tokio_tungstenite::connect_async(url))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    ws
}

async fn next_msg(ws: &mut Ws) -> WireMessage {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame within timeout")
            .expect("stream ended")
            .expect("read error");
        if let WsMessage::Text(text) = frame {
            return decode(&text).expect("relay sent an invalid frame");
        }
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

async fn assert_silent(ws: &mut Ws) {
    let got = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(got.is_err(), "expected no frame, got {got:?}");
}

/// Dial and consume the welcome.
async fn joined(addr: SocketAddr, id: &str, name: &str) -> Ws {
    let mut ws = dial(addr, &format!("id={id}&name={name}")).await;
    assert!(matches!(next_msg(&mut ws).await, WireMessage::Welcome(_)));
    ws
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut out = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

async fn next_event(session: &mut Session) -> SessionEvent {
    tokio::time::timeout(WAIT, session.recv())
        .await
        .expect("session event timed out")
        .expect("session closed")
}

fn body_of(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Welcome / join / leave
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_welcome_carries_identity_and_roster() {
    let relay = start_relay(0).await;
    let mut ws = dial(relay.addr, "id=a&name=Ann&avatar=%2Fa.png").await;
    match next_msg(&mut ws).await {
        WireMessage::Welcome(w) => {
            let you = w.you.unwrap();
            assert_eq!(you, UserRef::new("a", "Ann").with_avatar("/a.png"));
            assert_eq!(w.active_collaborators.len(), 1);
            assert_eq!(w.active_collaborators[0].user_id, "a");
            assert!(w.active_collaborators[0].is_active);
        }
        other => panic!("expected welcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_anonymous_connection_gets_guest_identity() {
    let relay = start_relay(0).await;
    let mut ws = dial(relay.addr, "").await;
    match next_msg(&mut ws).await {
        WireMessage::Welcome(w) => {
            let you = w.you.unwrap();
            assert!(you.name.starts_with("Guest-"));
            assert!(!you.id.is_empty());
        }
        other => panic!("expected welcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_goes_to_others_not_the_joiner() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;

    let mut b = dial(relay.addr, "id=b&name=Bo").await;
    match next_msg(&mut b).await {
        WireMessage::Welcome(w) => {
            let ids: Vec<_> = w.active_collaborators.iter().map(|c| c.user_id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b"]);
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    match next_msg(&mut a).await {
        WireMessage::Join(body) => assert_eq!(body.user.id, "b"),
        other => panic!("expected join, got {other:?}"),
    }
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_leave_broadcast_on_disconnect() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;
    let mut b = joined(relay.addr, "b", "Bo").await;
    assert!(matches!(next_msg(&mut a).await, WireMessage::Join(_)));

    b.close(None).await.unwrap();
    match next_msg(&mut a).await {
        WireMessage::Leave(body) => assert_eq!(body.user.id, "b"),
        other => panic!("expected leave, got {other:?}"),
    }
    assert_eq!(relay::collaborator_count(&relay.hub), 1);
}

#[tokio::test]
async fn test_second_tab_of_same_user_is_quiet() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;
    let mut a2 = joined(relay.addr, "a", "Ann").await;
    assert_silent(&mut a).await;
    assert_eq!(relay::collaborator_count(&relay.hub), 1);

    a2.close(None).await.unwrap();
    assert_silent(&mut a).await;
    assert_eq!(relay::collaborator_count(&relay.hub), 1);
}

// ---------------------------------------------------------------------------
// Client frames
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_activity_is_stamped_and_reaches_everyone() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;
    let mut b = joined(relay.addr, "b", "Bo").await;
    assert!(matches!(next_msg(&mut a).await, WireMessage::Join(_)));

    send(
        &mut a,
        json!({"type": "message", "details": "hello", "user": {"id": "b", "name": "Not Ann"}}),
    )
    .await;

    for ws in [&mut a, &mut b] {
        match next_msg(ws).await {
            WireMessage::Message(body) => {
                assert_eq!(body.user.id, "a");
                assert_eq!(body.user.name, "Ann");
                assert_eq!(body.details.as_deref(), Some("hello"));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_echo_goes_to_sender_only() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;
    let mut b = joined(relay.addr, "b", "Bo").await;
    assert!(matches!(next_msg(&mut a).await, WireMessage::Join(_)));

    send(&mut b, json!({"type": "echo", "payload": {"ping": 1}, "note": "x"})).await;
    match next_msg(&mut b).await {
        WireMessage::Echo(echo) => {
            assert_eq!(echo.get("payload"), Some(&json!({"ping": 1})));
            assert_eq!(echo.get("note"), Some(&json!("x")));
        }
        other => panic!("expected echo, got {other:?}"),
    }
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_test_frame_is_acknowledged() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;
    send(&mut a, json!({"type": "test", "message": "hi"})).await;
    match next_msg(&mut a).await {
        WireMessage::Test(t) => assert!(t.message.unwrap().contains("hi")),
        other => panic!("expected test ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_and_invalid_frames_get_errors() {
    let relay = start_relay(0).await;
    let mut a = joined(relay.addr, "a", "Ann").await;

    send(&mut a, json!({"type": "teleport"})).await;
    assert!(matches!(next_msg(&mut a).await, WireMessage::Error(e) if e.message.contains("teleport")));

    a.send(WsMessage::Text("not json".into())).await.unwrap();
    assert!(matches!(next_msg(&mut a).await, WireMessage::Error(_)));
}

#[tokio::test]
async fn test_roster_request_and_periodic_roster() {
    let relay = start_relay(1).await;
    let mut a = joined(relay.addr, "a", "Ann").await;

    send(&mut a, json!({"type": "roster_request"})).await;
    match next_msg(&mut a).await {
        WireMessage::Roster(r) => assert_eq!(r.collaborators.len(), 1),
        other => panic!("expected roster, got {other:?}"),
    }

    // The one-second ticker sends another without being asked.
    match next_msg(&mut a).await {
        WireMessage::Roster(r) => assert_eq!(r.collaborators[0].user_id, "a"),
        other => panic!("expected periodic roster, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_and_roster_endpoints() {
    let relay = start_relay(0).await;
    let _a = joined(relay.addr, "a", "Ann").await;

    let health = http_get(relay.addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    let v: Value = serde_json::from_str(body_of(&health)).unwrap();
    assert_eq!(v, json!({"status": "ok", "collaborators": 1}));

    let roster = http_get(relay.addr, "/roster").await;
    let v: Value = serde_json::from_str(body_of(&roster)).unwrap();
    assert_eq!(v[0]["userId"], "a");
    assert_eq!(v[0]["userName"], "Ann");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let relay = start_relay(0).await;
    assert!(http_get(relay.addr, "/nope").await.starts_with("HTTP/1.1 404"));
    // A plain GET on the socket path is not an upgrade.
    assert!(http_get(relay.addr, "/ws").await.starts_with("HTTP/1.1 404"));
}

// ---------------------------------------------------------------------------
// Full client stack against the relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_manager_session_and_presence_against_relay() {
    let relay = start_relay(0).await;
    let manager =
        ConnectionManager::new(ClientConfig::new(format!("ws://{}/ws?id=c&name=Cy", relay.addr)))
            .unwrap();
    let mut session = Session::attach(&manager);
    let mut state = CollabState::default();

    assert_eq!(next_event(&mut session).await, SessionEvent::Connected);

    // welcome, then the roster answering the automatic roster_request
    for expected in ["welcome", "roster"] {
        match next_event(&mut session).await {
            SessionEvent::Message(Inbound::Message(msg)) => {
                assert_eq!(msg.kind(), expected);
                state.apply(&msg);
            }
            other => panic!("expected {expected}, got {other:?}"),
        }
    }
    assert_eq!(state.me().map(|u| u.id.as_str()), Some("c"));
    assert_eq!(state.active_count(), 1);

    let mut other = joined(relay.addr, "d", "Di").await;
    match next_event(&mut session).await {
        SessionEvent::Message(Inbound::Message(msg)) => {
            let notice = state.apply(&msg).expect("join notice");
            assert_eq!(notice.to_string(), "Di joined the session");
        }
        other => panic!("expected join, got {other:?}"),
    }

    assert!(session.send(&WireMessage::chat(UserRef::new("c", "Cy"), "hi all")));
    match next_msg(&mut other).await {
        WireMessage::Message(body) => {
            assert_eq!(body.user.id, "c");
            assert_eq!(body.details.as_deref(), Some("hi all"));
        }
        other => panic!("expected chat, got {other:?}"),
    }

    manager.close();
    assert!(!manager.is_connected());
    match next_msg(&mut other).await {
        WireMessage::Leave(body) => assert_eq!(body.user.id, "c"),
        other => panic!("expected leave, got {other:?}"),
    }
}
