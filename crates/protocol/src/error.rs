//! Error types for the protocol crate.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::address::SessionId;
use crate::messages::RequestId;

/// Protocol error type covering transport and codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The channel was closed, locally or by the peer.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A broadcast targeted a session that no longer exists.
    #[error("unknown session: {session_id}")]
    UnknownSession {
        /// The unreachable session.
        session_id: SessionId,
    },

    /// A handshake name does not follow the addressing grammar.
    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

/// Failure of a remote operation issued through a connection or remote handle.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer's method failed; carries the error value it reported.
    #[error("remote call failed: {0}")]
    Remote(Value),

    /// The connection closed before a reply arrived.
    #[error("connection closed before a reply arrived")]
    Disconnected,

    /// No reply arrived within the configured request timeout.
    #[error("request {id} timed out after {after:?}")]
    Timeout {
        /// The abandoned request id.
        id: RequestId,
        /// The configured limit.
        after: Duration,
    },

    /// The operation cannot be expressed over the wire.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The underlying channel or codec failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type alias for remote operations.
pub type RpcResult<T> = std::result::Result<T, RpcError>;
