//! In-process transport.
//!
//! A [`MemoryHub`] plays the role of the environment both processes live in:
//! clients open channels through a [`MemoryEndpoint`] bound to a session, the
//! host receives them from [`MemoryHub::listen`], and reconnection pings are
//! delivered per session.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{Broadcaster, Channel, ChannelSink, Connector};
use crate::address::SessionId;
use crate::error::{ProtocolError, Result};
use crate::messages::BroadcastMessage;

/// Capacity of each session's broadcast buffer.
const BROADCAST_CAPACITY: usize = 16;

/// Sink that forwards values into the peer's inbound queue.
struct MemorySink {
    peer: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ChannelSink for MemorySink {
    fn post(&self, value: Value) -> Result<()> {
        let peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        match peer.as_ref() {
            Some(tx) => tx
                .send(value)
                .map_err(|_| ProtocolError::ChannelClosed("peer went away".to_string())),
            None => Err(ProtocolError::ChannelClosed(
                "channel was disconnected".to_string(),
            )),
        }
    }

    fn disconnect(&self) {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_connected(&self) -> bool {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Create two connected channel ends.
///
/// The first end is the accepting side and sees `session_id` as the sender's
/// session; the second end is the opening side and sees no session.
pub fn channel_pair(name: &str, session_id: Option<SessionId>) -> (Channel, Channel) {
    let (to_accepting, accepting_inbound) = mpsc::unbounded_channel();
    let (to_opening, opening_inbound) = mpsc::unbounded_channel();

    let accepting = Channel::new(
        name,
        session_id,
        Arc::new(MemorySink {
            peer: Mutex::new(Some(to_opening)),
        }),
        accepting_inbound,
    );
    let opening = Channel::new(
        name,
        None,
        Arc::new(MemorySink {
            peer: Mutex::new(Some(to_accepting)),
        }),
        opening_inbound,
    );

    (accepting, opening)
}

#[derive(Default)]
struct HubInner {
    acceptor: Mutex<Option<mpsc::UnboundedSender<Channel>>>,
    sessions: DashMap<SessionId, broadcast::Sender<BroadcastMessage>>,
}

/// Shared in-process environment connecting clients to one host.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the host. Replaces any previous listener.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// A client-side connector living in `session_id`.
    ///
    /// Creating an endpoint for a session makes that session reachable by
    /// broadcasts until [`close_session`](Self::close_session) is called.
    pub fn endpoint(&self, session_id: Option<SessionId>) -> MemoryEndpoint {
        if let Some(session) = session_id {
            self.inner
                .sessions
                .entry(session)
                .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0);
        }
        MemoryEndpoint {
            hub: self.clone(),
            session_id,
        }
    }

    /// Make a session unreachable. Its ping streams end.
    pub fn close_session(&self, session_id: SessionId) {
        if self.inner.sessions.remove(&session_id).is_some() {
            debug!(session_id = %session_id, "Closed memory session");
        }
    }

    /// Whether broadcasts to `session_id` can be delivered.
    pub fn has_session(&self, session_id: SessionId) -> bool {
        self.inner.sessions.contains_key(&session_id)
    }

    fn open(&self, name: &str, session_id: Option<SessionId>) -> Channel {
        let (accepting, opening) = channel_pair(name, session_id);

        let acceptor = self
            .inner
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let delivered = match acceptor {
            Some(tx) => match tx.send(accepting) {
                Ok(()) => true,
                Err(mpsc::error::SendError(accepting)) => {
                    accepting.sink().disconnect();
                    false
                }
            },
            None => false,
        };

        if !delivered {
            debug!(name = %name, "No listener for memory channel");
            opening.sink().disconnect();
        }
        opening
    }
}

impl Broadcaster for MemoryHub {
    fn send_to(
        &self,
        session_id: SessionId,
        message: &BroadcastMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let sender = self
            .inner
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone());
        let message = message.clone();

        async move {
            let sender = sender.ok_or(ProtocolError::UnknownSession { session_id })?;
            sender
                .send(message)
                .map(|_| ())
                .map_err(|_| ProtocolError::UnknownSession { session_id })
        }
    }
}

/// Client-side handle onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryEndpoint {
    hub: MemoryHub,
    session_id: Option<SessionId>,
}

impl MemoryEndpoint {
    /// The session channels opened here belong to.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }
}

impl Connector for MemoryEndpoint {
    fn connect(&self, name: &str) -> Result<Channel> {
        Ok(self.hub.open(name, self.session_id))
    }

    fn pings(&self) -> broadcast::Receiver<BroadcastMessage> {
        match self.session_id {
            Some(session) => self
                .hub
                .inner
                .sessions
                .entry(session)
                .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
                .subscribe(),
            // A session-less endpoint never receives pings.
            None => broadcast::channel(1).1,
        }
    }
}
