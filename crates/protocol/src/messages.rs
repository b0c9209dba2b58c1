//! Protocol message definitions for Portlink.
//!
//! Every message is a flat record: a numeric `id`, a `type` discriminant and
//! the fields of that type. Messages travel as structured values; the
//! transport owns any further serialization.
//!
//! ```text
//! {"id": 3, "type": "call", "name": "getVariable", "args": []}
//! {"id": 3, "type": "answer", "result": 1}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Request correlation id. Starts at 1 and is never reused within a connection.
pub type RequestId = u64;

/// Type discriminant of the reconnection ping broadcast.
pub const PING_TYPE: &str = "portlink-ping";

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Caller-assigned id; replies echo it.
    pub id: RequestId,
    /// The typed payload.
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Create a message with the given id and payload.
    pub fn new(id: RequestId, body: MessageBody) -> Self {
        Self { id, body }
    }
}

/// Message payloads, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    /// Handshake opener carrying the sender's exposed method names.
    Bootstrap {
        #[serde(rename = "exposedMethods")]
        exposed_methods: Vec<String>,
    },
    /// Handshake reply carrying the responder's exposed method names.
    BootstrapAnswer {
        #[serde(rename = "exposedMethods")]
        exposed_methods: Vec<String>,
    },
    /// Read an exposed property.
    Get { prop: String },
    /// Write an exposed property.
    Set { prop: String, value: Value },
    /// Invoke an exposed method.
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Successful reply. An absent `result` means "undefined"; `null` is a value.
    Answer {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present"
        )]
        result: Option<Value>,
    },
    /// Failed reply to a `call`.
    Error { error: Value },
    /// Ask the responder which session this channel belongs to.
    RequestId,
}

impl MessageBody {
    /// The wire name of this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Bootstrap { .. } => "bootstrap",
            MessageBody::BootstrapAnswer { .. } => "bootstrap-answer",
            MessageBody::Get { .. } => "get",
            MessageBody::Set { .. } => "set",
            MessageBody::Call { .. } => "call",
            MessageBody::Answer { .. } => "answer",
            MessageBody::Error { .. } => "error",
            MessageBody::RequestId => "request-id",
        }
    }

    /// Whether the peer is expected to reply to this message.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageBody::Bootstrap { .. }
                | MessageBody::Get { .. }
                | MessageBody::Set { .. }
                | MessageBody::Call { .. }
                | MessageBody::RequestId
        )
    }

    /// An `answer` carrying the given result.
    pub fn answer(result: Option<Value>) -> Self {
        MessageBody::Answer { result }
    }
}

/// A field that is present deserializes to `Some`, even when it is `null`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Encode a message into the structured value handed to the transport.
pub fn encode(message: &Message) -> Result<Value> {
    Ok(serde_json::to_value(message)?)
}

/// Decode a structured value received from the transport.
pub fn decode(value: Value) -> Result<Message> {
    Ok(serde_json::from_value(value)?)
}

/// One-shot messages delivered outside of any channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastMessage {
    /// Asks a disconnected client with this logical name to reconnect.
    #[serde(rename = "portlink-ping")]
    Ping {
        #[serde(rename = "logicalName")]
        logical_name: String,
    },
}

impl BroadcastMessage {
    /// A reconnection ping for the given logical name.
    pub fn ping(logical_name: impl Into<String>) -> Self {
        BroadcastMessage::Ping {
            logical_name: logical_name.into(),
        }
    }
}
