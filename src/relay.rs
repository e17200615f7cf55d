//! Server-side relay: roster, fan-out and the per-connection loop.
//!
//! ## Design
//! - `HubStore`: `Arc<Mutex<Hub>>` shared by every connection task.
//! - The hub owns one `tokio::sync::broadcast` channel. Each envelope may name
//!   a connection to skip, which is how `join` avoids echoing to the joiner.
//! - The roster is keyed by connection, ordered by arrival. A user with two
//!   open tabs appears once; `join` goes out on the first tab and `leave`
//!   after the last one closes.
//! - Identity comes from the upgrade URL and is stamped on everything the
//!   connection relays, so a client cannot speak for someone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::protocol::{
    decode_value, Collaborator, ErrorBody, EventBody, EventKind, ProtocolError, Roster, Test,
    UserRef, Welcome, WireMessage,
};

/// Shared hub handle.
pub type HubStore = Arc<Mutex<Hub>>;

/// One broadcast frame plus the connection that must not receive it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub skip: Option<u64>,
    pub message: WireMessage,
}

struct Member {
    conn_id: u64,
    collaborator: Collaborator,
}

pub struct Hub {
    members: Vec<Member>,
    next_conn_id: u64,
    tx: broadcast::Sender<Envelope>,
}

/// A connection's place in the hub.
pub struct Membership {
    pub conn_id: u64,
    pub collaborator: Collaborator,
    pub rx: broadcast::Receiver<Envelope>,
    /// No other connection of this user was open.
    pub first: bool,
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

pub fn new_hub(capacity: usize) -> HubStore {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Arc::new(Mutex::new(Hub {
        members: Vec::new(),
        next_conn_id: 1,
        tx,
    }))
}

/// `Guest-` plus four random uppercase alphanumerics.
pub fn guest_name() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("Guest-{suffix}")
}

/// Identity from upgrade query parameters. Blank values count as missing.
pub fn identify(params: &HashMap<String, String>) -> UserRef {
    let pick = |key: &str| {
        params
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    UserRef {
        id: pick("id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        name: pick("name").unwrap_or_else(guest_name),
        avatar: pick("avatar"),
    }
}

// ---------------------------------------------------------------------------
// Hub operations
// ---------------------------------------------------------------------------

/// Register a connection for `user`. `None` only if the hub lock is poisoned.
pub fn join(store: &HubStore, user: &UserRef) -> Option<Membership> {
    let mut hub = store.lock().ok()?;
    let first = !hub.members.iter().any(|m| m.collaborator.user_id == user.id);
    let conn_id = hub.next_conn_id;
    hub.next_conn_id += 1;
    let collaborator = Collaborator::joined(user, Utc::now());
    let rx = hub.tx.subscribe();
    hub.members.push(Member {
        conn_id,
        collaborator: collaborator.clone(),
    });
    Some(Membership {
        conn_id,
        collaborator,
        rx,
        first,
    })
}

/// Drop a connection. Returns its collaborator and whether it was the user's
/// last open connection.
pub fn leave(store: &HubStore, conn_id: u64) -> Option<(Collaborator, bool)> {
    let mut hub = store.lock().ok()?;
    let pos = hub.members.iter().position(|m| m.conn_id == conn_id)?;
    let member = hub.members.remove(pos);
    let last = !hub
        .members
        .iter()
        .any(|m| m.collaborator.user_id == member.collaborator.user_id);
    Some((member.collaborator, last))
}

/// Fan a frame out to every connection except `skip`.
pub fn broadcast(store: &HubStore, skip: Option<u64>, message: WireMessage) {
    if let Ok(hub) = store.lock() {
        // Err only means nobody is subscribed.
        let _ = hub.tx.send(Envelope { skip, message });
    }
}

/// Active collaborators, one per user, in order of arrival.
pub fn roster_snapshot(store: &HubStore) -> Vec<Collaborator> {
    let Ok(hub) = store.lock() else {
        return Vec::new();
    };
    let mut out: Vec<Collaborator> = Vec::with_capacity(hub.members.len());
    for m in &hub.members {
        if !out.iter().any(|c| c.user_id == m.collaborator.user_id) {
            out.push(m.collaborator.clone());
        }
    }
    out
}

pub fn collaborator_count(store: &HubStore) -> usize {
    roster_snapshot(store).len()
}

pub fn roster_message(store: &HubStore) -> WireMessage {
    WireMessage::Roster(Roster {
        collaborators: roster_snapshot(store),
        timestamp: Utc::now(),
    })
}

/// Broadcast the full roster every `interval`.
pub fn spawn_roster_ticker(store: HubStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nobody needs a roster at t=0.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let message = roster_message(&store);
            debug!("periodic roster broadcast");
            broadcast(&store, None, message);
        }
    })
}

// ---------------------------------------------------------------------------
// Client frame routing
// ---------------------------------------------------------------------------

/// What to do with one frame from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Send to every connection, sender included.
    Broadcast(WireMessage),
    /// Answer the sender only.
    Reply(WireMessage),
    Ignore,
}

fn error_reply(message: impl Into<String>) -> Route {
    Route::Reply(WireMessage::Error(ErrorBody {
        message: message.into(),
    }))
}

/// Put the sender's identity on a relayable event and default its timestamp.
pub fn stamp(value: &mut Value, sender: &UserRef) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if let Ok(user) = serde_json::to_value(sender) {
        obj.insert("user".to_string(), user);
    }
    let missing = obj.get("timestamp").map_or(true, Value::is_null);
    if missing {
        obj.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
}

/// Decide how to handle one text frame from `sender`.
pub fn route(store: &HubStore, sender: &UserRef, text: &str) -> Route {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return error_reply(ProtocolError::NotJson(e.to_string()).to_string()),
    };

    let relayable = value
        .get("type")
        .cloned()
        .and_then(|t| serde_json::from_value::<EventKind>(t).ok())
        .is_some_and(EventKind::is_relayable);
    if relayable {
        stamp(&mut value, sender);
    }

    match decode_value(value) {
        Ok(msg) if relayable => Route::Broadcast(msg),
        Ok(WireMessage::Echo(echo)) => Route::Reply(WireMessage::Echo(echo)),
        Ok(WireMessage::Test(test)) => Route::Reply(WireMessage::Test(Test {
            message: Some(format!(
                "test received: {}",
                test.message.as_deref().unwrap_or("(no message)")
            )),
            timestamp: Some(Utc::now()),
        })),
        Ok(WireMessage::RosterRequest) => Route::Reply(roster_message(store)),
        Ok(other) => {
            debug!(kind = other.kind(), user = %sender.id, "client frame ignored");
            Route::Ignore
        }
        Err(e) => error_reply(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// WebSocket handler
// ---------------------------------------------------------------------------

async fn send_frame<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
    message: &WireMessage,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match message.to_json() {
        Ok(text) => sink.send(WsMessage::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, kind = message.kind(), "failed to encode frame");
            true
        }
    }
}

/// Drive one upgraded connection until either side closes.
pub async fn handle_ws<S>(ws_stream: WebSocketStream<S>, store: HubStore, user: UserRef)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(membership) = join(&store, &user) else {
        warn!("hub unavailable; dropping connection");
        return;
    };
    let Membership {
        conn_id,
        collaborator,
        mut rx,
        first,
    } = membership;
    info!(conn_id, user = %user.id, name = %user.name, "collaborator connected");

    let (mut ws_sink, mut ws_rx) = ws_stream.split();

    let welcome = WireMessage::Welcome(Welcome {
        you: Some(user.clone()),
        active_collaborators: roster_snapshot(&store),
        timestamp: Utc::now(),
    });
    if !send_frame(&mut ws_sink, &welcome).await {
        debug!(conn_id, "welcome not delivered; dropping connection");
        // Nobody heard a join for this connection. Only announce a leave if
        // another tab of the same user was announced and has since closed.
        if let Some((collaborator, last)) = leave(&store, conn_id) {
            if last && !first {
                broadcast(
                    &store,
                    None,
                    WireMessage::Leave(EventBody::new(collaborator.user_ref(), Utc::now())),
                );
            }
        }
        return;
    }
    if first {
        broadcast(
            &store,
            Some(conn_id),
            WireMessage::Join(EventBody::new(
                collaborator.user_ref(),
                collaborator.joined_at,
            )),
        );
    }

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match route(&store, &user, &text) {
                            Route::Broadcast(msg) => broadcast(&store, None, msg),
                            Route::Reply(msg) => {
                                if !send_frame(&mut ws_sink, &msg).await {
                                    break;
                                }
                            }
                            Route::Ignore => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary, ping, pong
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }

            bcast = rx.recv() => {
                match bcast {
                    Ok(env) => {
                        if env.skip == Some(conn_id) {
                            continue;
                        }
                        if !send_frame(&mut ws_sink, &env.message).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn_id, skipped = n, "receiver lagged; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let Some((collaborator, last)) = leave(&store, conn_id) {
        info!(conn_id, user = %collaborator.user_id, "collaborator disconnected");
        if last {
            broadcast(
                &store,
                None,
                WireMessage::Leave(EventBody::new(collaborator.user_ref(), Utc::now())),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
