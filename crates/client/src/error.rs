//! Error types for the client crate.

use protocol::{ProtocolError, RpcError};
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connector could not open a channel.
    #[error("failed to open channel: {0}")]
    Connect(#[from] ProtocolError),

    /// A remote operation failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The wrapper was shut down or its page unloaded.
    #[error("client has been shut down")]
    Shutdown,
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
