//! JSON wire protocol between browsers and the retro server.
//!
//! Every frame is a WebSocket text message holding one JSON object whose
//! `type` field names the message:
//! ```text
//! client → server   join | start | addTopic | goToGrouping | moveTopic
//!                   goToVoting | setVotes | goToDiscussion | addAction
//! server → client   init | join | addTopic | moveTopic | updateVotes | error
//! ```
//!
//! Both directions are closed enums, so adding a message kind is a compile
//! error at every `match` until it is handled.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use retro_core::{Action, ClusterId, Event, Feeling, PersonSummary, RoomSnapshot};

/// Prefix of the WebSocket path that scopes a connection to a room.
pub const RETRO_PATH_PREFIX: &str = "/ws/retro/";

const MAX_ROOM_ID_LEN: usize = 64;

// ───────────────────────────────────────────────────────────────────
// Room identifiers
// ───────────────────────────────────────────────────────────────────

/// Opaque room identifier: one or more of `[-A-Za-z0-9]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ROOM_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ProtocolError::InvalidRoomId(raw.to_string()))
        }
    }

    /// Extract the room from a request path like `/ws/retro/<id>/`.
    /// Query strings and a single trailing slash are ignored.
    pub fn from_path(path: &str) -> Result<Self, ProtocolError> {
        let path = path.split('?').next().unwrap_or_default();
        let rest = path
            .strip_prefix(RETRO_PATH_PREFIX)
            .ok_or_else(|| ProtocolError::InvalidRoomId(path.to_string()))?;
        Self::parse(rest.strip_suffix('/').unwrap_or(rest))
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path a client connects to for this room.
    pub fn path(&self) -> String {
        format!("{RETRO_PATH_PREFIX}{}/", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoomId::parse(&raw).map_err(D::Error::custom)
    }
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// Messages a browser sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join {
        name: String,
    },
    Start,
    AddTopic {
        text: String,
        list: Feeling,
    },
    GoToGrouping,
    MoveTopic {
        text: String,
        #[serde(deserialize_with = "coordinate")]
        x: i32,
        #[serde(deserialize_with = "coordinate")]
        y: i32,
    },
    GoToVoting {
        clusters: Vec<Vec<String>>,
    },
    SetVotes {
        #[serde(deserialize_with = "cluster_ids")]
        votes: Vec<ClusterId>,
    },
    GoToDiscussion,
    AddAction {
        text: String,
    },
}

/// Browsers report drag positions from layout boxes, which are fractional.
fn coordinate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() {
        return Err(D::Error::custom("coordinate must be a finite number"));
    }
    Ok(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}

/// A cluster id as browsers send it. Ids collected from object keys arrive
/// as decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireClusterId {
    Number(u32),
    Text(String),
}

fn cluster_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ClusterId>, D::Error> {
    Vec::<WireClusterId>::deserialize(deserializer)?
        .into_iter()
        .map(|id| match id {
            WireClusterId::Number(n) => Ok(ClusterId(n)),
            WireClusterId::Text(text) if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => text
                .parse()
                .map(ClusterId)
                .map_err(|_| D::Error::custom(format!("cluster id {text:?} is out of range"))),
            WireClusterId::Text(text) => Err(D::Error::custom(format!("invalid cluster id {text:?}"))),
        })
        .collect()
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

impl From<ClientMessage> for Action {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Join { name } => Action::Join { name },
            ClientMessage::Start => Action::Start,
            ClientMessage::AddTopic { text, list } => Action::AddTopic { text, feeling: list },
            ClientMessage::GoToGrouping => Action::GoToGrouping,
            ClientMessage::MoveTopic { text, x, y } => Action::MoveTopic { text, x, y },
            ClientMessage::GoToVoting { clusters } => Action::GoToVoting { groupings: clusters },
            ClientMessage::SetVotes { votes } => Action::SetVotes { votes },
            ClientMessage::GoToDiscussion => Action::GoToDiscussion,
            ClientMessage::AddAction { text } => Action::AddActionItem { text },
        }
    }
}

impl From<Action> for ClientMessage {
    fn from(action: Action) -> Self {
        match action {
            Action::Join { name } => ClientMessage::Join { name },
            Action::Start => ClientMessage::Start,
            Action::AddTopic { text, feeling } => ClientMessage::AddTopic { text, list: feeling },
            Action::GoToGrouping => ClientMessage::GoToGrouping,
            Action::MoveTopic { text, x, y } => ClientMessage::MoveTopic { text, x, y },
            Action::GoToVoting { groupings } => ClientMessage::GoToVoting { clusters: groupings },
            Action::SetVotes { votes } => ClientMessage::SetVotes { votes },
            Action::GoToDiscussion => ClientMessage::GoToDiscussion,
            Action::AddActionItem { text } => ClientMessage::AddAction { text },
        }
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full room snapshot.
    Init(RoomSnapshot),
    Join {
        name: String,
    },
    AddTopic {
        list: Feeling,
        text: String,
    },
    MoveTopic {
        text: String,
        x: i32,
        y: i32,
    },
    UpdateVotes {
        people: Vec<PersonSummary>,
    },
    /// Rejection of the recipient's own last action.
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl fmt::Display) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        match event {
            Event::PersonJoined { name } => ServerMessage::Join { name },
            Event::RoomSynced(snapshot) => ServerMessage::Init(snapshot),
            Event::TopicAdded { text, feeling } => ServerMessage::AddTopic { list: feeling, text },
            Event::TopicMoved { text, x, y } => ServerMessage::MoveTopic { text, x, y },
            Event::VotesUpdated { people } => ServerMessage::UpdateVotes { people },
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::MalformedMessage(_) => "malformedMessage",
            ProtocolError::SerializationError(_) => "serializationError",
            ProtocolError::InvalidRoomId(_) => "invalidRoomId",
            ProtocolError::ConnectionClosed => "connectionClosed",
        }
    }
}
