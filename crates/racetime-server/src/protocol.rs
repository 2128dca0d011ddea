//! Wire format of the race socket.
//!
//! Every frame the server sends is a JSON object with a `type` field; the
//! rest of the object depends on the type. Clients send
//! `{"action": ..., "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use racetime_core::chat::ChatMessage;
use racetime_core::ids::RaceSlug;
use racetime_core::race::RaceData;

pub const INVALID_DATA: &str = "Unable to process that message (encountered invalid or possibly corrupted data). Sorry about that.";
pub const UNKNOWN_ACTION: &str =
    "Action is missing or not recognised. Check your input and try again.";
pub const PERMISSION_DENIED: &str =
    "Permission denied, you may need to re-authorise this application.";
pub const NO_HISTORY: &str = "Could not retrieve chat history.";
pub const INTERNAL_ERROR: &str = "Something went wrong processing that action. Try again later.";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "race.data")]
    RaceData { race: Box<RaceData> },
    #[serde(rename = "chat.message")]
    ChatMessage { message: ChatMessage },
    #[serde(rename = "chat.history")]
    ChatHistory { messages: Vec<ChatMessage> },
    #[serde(rename = "error")]
    Error { errors: Vec<String> },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn race(data: RaceData) -> Self {
        Self::RaceData {
            race: Box::new(data),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            errors: vec![msg.into()],
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RaceData { .. } => "race.data",
            Self::ChatMessage { .. } => "chat.message",
            Self::ChatHistory { .. } => "chat.history",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }

    /// A system chat message means the race itself changed.
    pub fn is_system_chat(&self) -> bool {
        matches!(self, Self::ChatMessage { message } if message.is_system)
    }
}

/// Event published to every socket watching `race`.
#[derive(Clone, Debug)]
pub struct RaceBroadcast {
    pub race: RaceSlug,
    pub message: ServerMessage,
}

/// An incoming frame, after JSON decoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientRequest {
    pub action: Option<String>,
    pub data: Option<Value>,
}

impl ClientRequest {
    /// Decode a text frame. Only malformed JSON is an error; a frame
    /// without a usable `action` decodes to `action: None`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self {
            action: value.get("action").and_then(Value::as_str).map(str::to_owned),
            data: value.get("data").cloned(),
        })
    }
}
