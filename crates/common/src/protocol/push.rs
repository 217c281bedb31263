// Push-channel wire format.
//
// Every WebSocket text message is one JSON `Frame`:
//   {"event": "<name>", "data": <payload>, "ack": <id>?}
//
// A frame carrying `ack` asks the peer to answer with an `ack` frame that
// echoes the same id. Acknowledgment is optional on the receiving side.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::types::ChatMessage;

// ── Event names ─────────────────────────────────────────────────────

pub const JOIN_ROOM: &str = "joinRoom";
pub const LEAVE_ROOM: &str = "leaveRoom";
pub const TYPING: &str = "typing";
pub const SEND_SYSTEM: &str = "sendSystem";

pub const CHAT_NEW: &str = "chat:new";
pub const CHAT_SYSTEM: &str = "chat:system";
pub const CHAT_DELETED: &str = "chat:deleted";
pub const CHAT_TYPING: &str = "chat:typing";
pub const CHAT_SEEN: &str = "chat:seen";

/// Reserved event name for acknowledgment replies.
pub const ACK: &str = "ack";

/// Inbound chat events, in the order a room session subscribes to them.
pub const CHAT_EVENTS: &[&str] = &[CHAT_NEW, CHAT_SYSTEM, CHAT_DELETED, CHAT_TYPING, CHAT_SEEN];

// ── Frame ───────────────────────────────────────────────────────────

/// A single push-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data, ack: None }
    }

    /// Ask the receiver to acknowledge this frame under `ack_id`.
    pub fn with_ack(mut self, ack_id: u64) -> Self {
        self.ack = Some(ack_id);
        self
    }

    /// Reply to a frame that requested acknowledgment.
    pub fn ack_reply(ack_id: u64, data: Value) -> Self {
        Self { event: ACK.to_string(), data, ack: Some(ack_id) }
    }

    pub fn is_ack_reply(&self) -> bool {
        self.event == ACK && self.ack.is_some()
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Events this client emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom { room_id: String },

    #[serde(rename = "leaveRoom", rename_all = "camelCase")]
    LeaveRoom { room_id: String },

    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { room_id: String, is_typing: bool },

    #[serde(rename = "sendSystem", rename_all = "camelCase")]
    SendSystem { room_id: String, text: String, files: Vec<String> },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => JOIN_ROOM,
            Self::LeaveRoom { .. } => LEAVE_ROOM,
            Self::Typing { .. } => TYPING,
            Self::SendSystem { .. } => SEND_SYSTEM,
        }
    }

    /// The `data` half of the frame.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut tagged)) => tagged.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(self.name(), self.payload())
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Events the server pushes to a chat namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:new", rename_all = "camelCase")]
    ChatNew { room_id: String, msg: ChatMessage },

    #[serde(rename = "chat:system", rename_all = "camelCase")]
    ChatSystem { room_id: String, msg: ChatMessage },

    #[serde(rename = "chat:deleted", rename_all = "camelCase")]
    ChatDeleted { room_id: String, msg_id: String },

    #[serde(rename = "chat:typing", rename_all = "camelCase")]
    ChatTyping {
        room_id: String,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    #[serde(rename = "chat:seen", rename_all = "camelCase")]
    ChatSeen { room_id: String, msg_ids: Vec<String> },
}

impl ServerEvent {
    /// Decode a typed event from a raw event name and payload.
    pub fn decode(event: &str, data: &Value) -> Result<Self, ProtocolError> {
        if !CHAT_EVENTS.contains(&event) {
            return Err(ProtocolError::UnknownEvent(event.to_string()));
        }
        serde_json::from_value(json!({ "event": event, "data": data }))
            .map_err(|error| ProtocolError::malformed(event, error))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Self::decode(&frame.event, &frame.data)
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::ChatNew { room_id, .. }
            | Self::ChatSystem { room_id, .. }
            | Self::ChatDeleted { room_id, .. }
            | Self::ChatTyping { room_id, .. }
            | Self::ChatSeen { room_id, .. } => room_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatNew { .. } => CHAT_NEW,
            Self::ChatSystem { .. } => CHAT_SYSTEM,
            Self::ChatDeleted { .. } => CHAT_DELETED,
            Self::ChatTyping { .. } => CHAT_TYPING,
            Self::ChatSeen { .. } => CHAT_SEEN,
        }
    }
}
