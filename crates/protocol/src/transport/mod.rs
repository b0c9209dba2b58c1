//! Channel interfaces the protocol runs on.
//!
//! The transport is opaque: it moves structured values between two ends,
//! reports when the other end goes away, and can be closed from either side.
//! Ordering is whatever the transport provides; nothing here adds to it.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::address::SessionId;
use crate::error::Result;
use crate::messages::BroadcastMessage;

/// Outbound half of a channel.
pub trait ChannelSink: Send + Sync {
    /// Hand a value to the transport.
    fn post(&self, value: Value) -> Result<()>;

    /// Close the channel. The peer's inbound stream ends.
    fn disconnect(&self);

    /// Whether `post` can still succeed.
    fn is_connected(&self) -> bool;
}

/// One end of an open channel.
pub struct Channel {
    name: String,
    session_id: Option<SessionId>,
    sink: Arc<dyn ChannelSink>,
    inbound: mpsc::UnboundedReceiver<Value>,
}

impl Channel {
    /// Assemble a channel end from its parts.
    pub fn new(
        name: impl Into<String>,
        session_id: Option<SessionId>,
        sink: Arc<dyn ChannelSink>,
        inbound: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            session_id,
            sink,
            inbound,
        }
    }

    /// The handshake name the channel was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ambient session of the sender, as visible to this end.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn sink(&self) -> &Arc<dyn ChannelSink> {
        &self.sink
    }

    /// Split into name, session, sink and inbound stream.
    pub fn into_parts(
        self,
    ) -> (
        String,
        Option<SessionId>,
        Arc<dyn ChannelSink>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        (self.name, self.session_id, self.sink, self.inbound)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("connected", &self.sink.is_connected())
            .finish()
    }
}

/// Client-side transport: opens channels and receives broadcasts.
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to the host under the given handshake name.
    fn connect(&self, name: &str) -> Result<Channel>;

    /// Stream of broadcasts addressed to this client's session.
    fn pings(&self) -> broadcast::Receiver<BroadcastMessage>;
}

/// Host-side one-shot delivery to a session.
pub trait Broadcaster: Send + Sync + 'static {
    /// Deliver a message to every listener in `session_id`.
    ///
    /// Fails when the session no longer exists.
    fn send_to(
        &self,
        session_id: SessionId,
        message: &BroadcastMessage,
    ) -> impl Future<Output = Result<()>> + Send;
}
