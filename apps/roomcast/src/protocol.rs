use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::WsError;

/// Presence event names broadcast on join/leave; never replay-cached.
pub const USER_CONNECTED_EVENT: &str = "user connected";
pub const USER_DISCONNECTED_EVENT: &str = "user disconnected";

/// Messages clients send over the socket.
///
/// `room` and `event` are accepted as arbitrary JSON so that a missing or
/// wrong-typed field answers with an `illegal_value` error frame instead of
/// failing the whole parse. Room operations may carry an optional `id`,
/// echoed back on the reply frame for correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        room: Option<Value>,
        #[serde(default, rename = "lastDisconnectTime")]
        last_disconnect_time: Option<i64>,
        #[serde(default)]
        id: Option<String>,
    },
    Unsubscribe {
        #[serde(default)]
        room: Option<Value>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "get connected users")]
    GetConnectedUsers {
        #[serde(default)]
        room: Option<Value>,
        #[serde(default)]
        id: Option<String>,
    },
    Emit {
        #[serde(default)]
        room: Option<Value>,
        #[serde(default)]
        event: Option<Value>,
        #[serde(default)]
        message: Option<Value>,
        #[serde(default)]
        id: Option<String>,
    },
    Ping,
}

impl ClientMessage {
    /// Caller-supplied correlation id, echoed on the reply frame.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { id, .. }
            | ClientMessage::Unsubscribe { id, .. }
            | ClientMessage::GetConnectedUsers { id, .. }
            | ClientMessage::Emit { id, .. } => id.as_deref(),
            ClientMessage::Ping => None,
        }
    }
}

/// Frames the server sends. Requests on one connection are handled
/// sequentially, so replies correlate with requests by order; `id` carries
/// the request's correlation id when the caller supplied one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missed: Option<Vec<RoomEvent>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Unsubscribed {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    ConnectedUsers {
        room: String,
        users: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Event {
        room: String,
        event: String,
        data: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong,
}

/// A replayable room event as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event: String,
    pub data: Value,
}

/// Wire form stored in the replay log and carried on the cluster `pub`
/// channel. `seq` is a per-node insertion counter breaking ties between
/// entries emitted in the same millisecond.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub event: String,
    pub data: Value,
}

pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn require_room(room: &Option<Value>) -> Result<&str, WsError> {
    match room {
        Some(Value::String(path)) => Ok(path),
        Some(_) => Err(WsError::IllegalValue("room must be a string".to_string())),
        None => Err(WsError::IllegalValue(
            "payload requires a room field".to_string(),
        )),
    }
}

pub fn require_event(event: &Option<Value>) -> Result<&str, WsError> {
    match event {
        Some(Value::String(name)) => Ok(name),
        Some(_) => Err(WsError::IllegalValue("event must be a string".to_string())),
        None => Err(WsError::IllegalValue(
            "payload requires an event field".to_string(),
        )),
    }
}
