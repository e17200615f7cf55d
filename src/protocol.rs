//! Wire contract shared by the relay and the connection manager.
//!
//! Every frame is a JSON object with a `type` discriminator. Frames are decoded
//! once, at the boundary, into [`WireMessage`]; anything that does not fit is
//! classified by [`Inbound`] instead of falling through silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every `type` value the contract knows about.
pub const KNOWN_TYPES: &[&str] = &[
    "welcome",
    "join",
    "leave",
    "action",
    "message",
    "presence",
    "activity",
    "echo",
    "test",
    "roster",
    "roster_request",
    "error",
];

/// Who did something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// The six collaboration event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Join,
    Leave,
    Action,
    Message,
    Presence,
    Activity,
}

impl EventKind {
    /// Kinds a client may send for the relay to fan out.
    pub fn is_relayable(self) -> bool {
        matches!(
            self,
            EventKind::Action | EventKind::Message | EventKind::Presence | EventKind::Activity
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Join => "join",
            EventKind::Leave => "leave",
            EventKind::Action => "action",
            EventKind::Message => "message",
            EventKind::Presence => "presence",
            EventKind::Activity => "activity",
        };
        write!(f, "{s}")
    }
}

/// Fields shared by all collaboration events. For chat (`message`) events the
/// text travels in `details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub user: UserRef,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EventBody {
    pub fn new(user: UserRef, timestamp: DateTime<Utc>) -> Self {
        Self {
            user,
            timestamp,
            action: None,
            target: None,
            details: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// A collaboration event detached from the wire envelope, as kept in the
/// activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub body: EventBody,
}

impl CollaborationEvent {
    pub fn new(kind: EventKind, body: EventBody) -> Self {
        Self { kind, body }
    }

    pub fn into_wire(self) -> WireMessage {
        WireMessage::from_event(self.kind, self.body)
    }
}

/// Presence record for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Collaborator {
    /// A freshly joined, active collaborator.
    pub fn joined(user: &UserRef, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            avatar: user.avatar.clone(),
            joined_at: at,
            is_active: true,
            last_seen: None,
        }
    }

    pub fn user_ref(&self) -> UserRef {
        UserRef {
            id: self.user_id.clone(),
            name: self.user_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// First frame the relay sends to a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Identity the relay assigned to this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub you: Option<UserRef>,
    #[serde(default)]
    pub active_collaborators: Vec<Collaborator>,
    pub timestamp: DateTime<Utc>,
}

/// Full roster snapshot, sent periodically and on `roster_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    pub timestamp: DateTime<Utc>,
}

/// Debug frame returned to its sender as-is. Every field other than `type`
/// is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Echo {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// One frame of the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Welcome(Welcome),
    Join(EventBody),
    Leave(EventBody),
    Action(EventBody),
    Message(EventBody),
    Presence(EventBody),
    Activity(EventBody),
    Echo(Echo),
    Test(Test),
    Roster(Roster),
    RosterRequest,
    Error(ErrorBody),
}

impl WireMessage {
    pub fn from_event(kind: EventKind, body: EventBody) -> Self {
        match kind {
            EventKind::Join => WireMessage::Join(body),
            EventKind::Leave => WireMessage::Leave(body),
            EventKind::Action => WireMessage::Action(body),
            EventKind::Message => WireMessage::Message(body),
            EventKind::Presence => WireMessage::Presence(body),
            EventKind::Activity => WireMessage::Activity(body),
        }
    }

    /// A chat line from `user`.
    pub fn chat(user: UserRef, text: impl Into<String>) -> Self {
        WireMessage::Message(EventBody::new(user, Utc::now()).with_details(text))
    }

    /// The `type` string this frame carries.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Welcome(_) => "welcome",
            WireMessage::Join(_) => "join",
            WireMessage::Leave(_) => "leave",
            WireMessage::Action(_) => "action",
            WireMessage::Message(_) => "message",
            WireMessage::Presence(_) => "presence",
            WireMessage::Activity(_) => "activity",
            WireMessage::Echo(_) => "echo",
            WireMessage::Test(_) => "test",
            WireMessage::Roster(_) => "roster",
            WireMessage::RosterRequest => "roster_request",
            WireMessage::Error(_) => "error",
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            WireMessage::Join(_) => Some(EventKind::Join),
            WireMessage::Leave(_) => Some(EventKind::Leave),
            WireMessage::Action(_) => Some(EventKind::Action),
            WireMessage::Message(_) => Some(EventKind::Message),
            WireMessage::Presence(_) => Some(EventKind::Presence),
            WireMessage::Activity(_) => Some(EventKind::Activity),
            _ => None,
        }
    }

    /// The collaboration event carried by this frame, if it is one.
    pub fn collaboration_event(&self) -> Option<CollaborationEvent> {
        let body = match self {
            WireMessage::Join(b)
            | WireMessage::Leave(b)
            | WireMessage::Action(b)
            | WireMessage::Message(b)
            | WireMessage::Presence(b)
            | WireMessage::Activity(b) => b.clone(),
            _ => return None,
        };
        self.event_kind().map(|kind| CollaborationEvent::new(kind, body))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Boundary decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not JSON: {0}")]
    NotJson(String),
    #[error("frame has no string 'type' field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("malformed '{kind}' message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<WireMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
    decode_value(value)
}

/// Decode an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<WireMessage, ProtocolError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

/// What a message listener receives for one incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A frame that matched the contract.
    Message(WireMessage),
    /// Valid JSON with a `type` nobody knows.
    Unknown { kind: String, payload: Value },
    /// Valid JSON that does not fit its declared `type` (or has none).
    Invalid { reason: String, payload: Value },
    /// Not JSON at all; delivered verbatim.
    Raw(String),
}

impl Inbound {
    pub fn from_text(text: &str) -> Self {
        let payload: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Inbound::Raw(text.to_string()),
        };
        match decode_value(payload.clone()) {
            Ok(msg) => Inbound::Message(msg),
            Err(ProtocolError::UnknownType(kind)) => Inbound::Unknown { kind, payload },
            Err(e) => Inbound::Invalid {
                reason: e.to_string(),
                payload,
            },
        }
    }

    pub fn message(&self) -> Option<&WireMessage> {
        match self {
            Inbound::Message(m) => Some(m),
            _ => None,
        }
    }

    /// The JSON payload, when the frame parsed as JSON.
    pub fn json(&self) -> Option<Value> {
        match self {
            Inbound::Message(m) => serde_json::to_value(m).ok(),
            Inbound::Unknown { payload, .. } | Inbound::Invalid { payload, .. } => {
                Some(payload.clone())
            }
            Inbound::Raw(_) => None,
        }
    }
}
