use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Message;

/// Every `type` a client may send. Anything else is answered with `UNKNOWN_EVENT`.
pub const CLIENT_EVENT_TYPES: &[&str] = &[
    "message.send",
    "thread.join",
    "thread.leave",
    "read.update",
    "typing",
];

/// Frames sent FROM client TO server. Envelope is `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "message.send")]
    MessageSend(SendMessage),

    #[serde(rename = "thread.join")]
    ThreadJoin(ThreadRef),

    #[serde(rename = "thread.leave")]
    ThreadLeave(ThreadRef),

    #[serde(rename = "read.update")]
    ReadUpdate(ReadUpdate),

    #[serde(rename = "typing")]
    Typing(TypingUpdate),
}

impl ClientEvent {
    /// Parse a text frame, telling apart a malformed envelope or payload
    /// (`Validation`) from a well-formed envelope with an unknown `type`.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Validation(e.to_string()))?;

        if !CLIENT_EVENT_TYPES.contains(&raw.kind.as_str()) {
            return Err(ProtocolError::UnknownEvent(raw.kind));
        }

        let tagged = serde_json::json!({
            "type": raw.kind,
            "payload": raw.payload.unwrap_or(serde_json::Value::Null),
        });
        serde_json::from_value(tagged).map_err(|e| ProtocolError::Validation(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageSend(_) => "message.send",
            Self::ThreadJoin(_) => "thread.join",
            Self::ThreadLeave(_) => "thread.leave",
            Self::ReadUpdate(_) => "read.update",
            Self::Typing(_) => "typing",
        }
    }

    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::MessageSend(e) => e.thread_id,
            Self::ThreadJoin(e) | Self::ThreadLeave(e) => e.thread_id,
            Self::ReadUpdate(e) => e.thread_id,
            Self::Typing(e) => e.thread_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Validation(String),

    #[error("unknown event type '{0}'")]
    UnknownEvent(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::UnknownEvent(_) => ErrorCode::UnknownEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub thread_id: Uuid,
    pub content: String,
    /// Client correlation id for the optimistic copy; echoed back on `message.new`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub thread_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadUpdate {
    pub thread_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingUpdate {
    pub thread_id: Uuid,
    #[serde(default = "default_is_typing")]
    pub is_typing: bool,
}

fn default_is_typing() -> bool {
    true
}

/// Frames sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "message.new")]
    MessageNew(NewMessage),

    #[serde(rename = "message.delta")]
    MessageDelta(MessageDelta),

    #[serde(rename = "thread.joined")]
    ThreadJoined(ThreadRef),

    #[serde(rename = "thread.left")]
    ThreadLeft(ThreadRef),

    #[serde(rename = "read.updated")]
    ReadUpdated(ReadUpdated),

    #[serde(rename = "typing")]
    Typing(TypingEvent),

    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Returns the thread this event is scoped to, if any.
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageNew(e) => Some(e.message.thread_id),
            Self::MessageDelta(e) => Some(e.thread_id),
            Self::ThreadJoined(e) | Self::ThreadLeft(e) => Some(e.thread_id),
            Self::ReadUpdated(e) => Some(e.thread_id),
            Self::Typing(e) => Some(e.thread_id),
            Self::Error(e) => e.thread_id,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
            thread_id: None,
            temp_id: None,
            stream_id: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
}

/// Not-yet-persisted fragment of a streaming assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    pub thread_id: Uuid,
    pub stream_id: Uuid,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadUpdated {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub last_read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ThreadNotFound,
    Forbidden,
    ValidationError,
    UnknownEvent,
    ServerError,
}
