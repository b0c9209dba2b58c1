//! Single-channel client lifecycle.
//!
//! [`ClientWrapper`] opens one channel to the host and keeps a
//! [`Connection`] on it. When the channel closes the wrapper forgets the
//! connection and reports [`ClientEvent::Disconnected`]; a reconnection
//! ping from the host, or the next call to
//! [`remote_handle`](ClientWrapper::remote_handle), opens a fresh one under
//! the same name.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use protocol::transport::Connector;
use protocol::{
    BroadcastMessage, ChannelName, Connection, ConnectionOptions, ExposedSurface, RemoteHandle,
    SessionId,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 16;

/// Where the client lives, which decides the handshake name it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientContext {
    /// Inside a session; the host learns the session from the channel.
    #[default]
    Session,
    /// Outside any session but attached to one, such as a devtools panel
    /// inspecting a tab. The inspected session becomes part of the name.
    Devtools { inspected_session: SessionId },
    /// Outside any session.
    SessionAgnostic,
}

impl ClientContext {
    /// The handshake name for `logical_name` in this context.
    pub fn channel_name(&self, logical_name: &str) -> ChannelName {
        match self {
            ClientContext::Session => ChannelName::session_scoped(logical_name),
            ClientContext::Devtools { inspected_session } => {
                ChannelName::with_session_suffix(logical_name, *inspected_session)
            }
            ClientContext::SessionAgnostic => ChannelName::session_agnostic(logical_name),
        }
    }
}

/// Lifecycle notifications of a [`ClientWrapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A channel was opened and a connection built on it.
    Connected { connection_id: Uuid },
    /// The current connection closed.
    Disconnected { connection_id: Uuid },
}

/// Settings for a [`ClientWrapper`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub context: ClientContext,
    pub connection: ConnectionOptions,
    /// Unload hook. Cancelling it shuts the wrapper down and closes the
    /// channel.
    pub unload: Option<CancellationToken>,
}

struct Inner<C> {
    logical_name: String,
    channel_name: String,
    surface: ExposedSurface,
    connector: C,
    connection_options: ConnectionOptions,
    connection: Mutex<Option<Connection>>,
    shutdown: CancellationToken,
    events: broadcast::Sender<ClientEvent>,
}

/// The connecting side's single reconnecting connection. Cheap to clone.
pub struct ClientWrapper<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ClientWrapper<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ClientWrapper<C> {
    /// Open a channel named after `logical_name` and start serving `surface`
    /// on it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        logical_name: impl Into<String>,
        surface: ExposedSurface,
        connector: C,
        options: ClientOptions,
    ) -> Result<Self> {
        let logical_name = logical_name.into();
        let channel_name = options.context.channel_name(&logical_name).encode();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            logical_name,
            channel_name,
            surface,
            connector,
            connection_options: options.connection,
            connection: Mutex::new(None),
            shutdown: CancellationToken::new(),
            events,
        });

        Inner::open(&inner)?;
        spawn_ping_listener(&inner);
        if let Some(unload) = options.unload {
            spawn_unload_hook(&inner, unload);
        }

        Ok(Self { inner })
    }

    pub fn logical_name(&self) -> &str {
        &self.inner.logical_name
    }

    /// The encoded handshake name channels are opened with.
    pub fn channel_name(&self) -> &str {
        &self.inner.channel_name
    }

    /// The host's handle, reopening the channel first if it is closed.
    pub async fn remote_handle(&self) -> Result<RemoteHandle> {
        let connection = Inner::ensure_connected(&self.inner)?;
        Ok(connection.remote_handle().await?)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.current()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current().is_some()
    }

    /// Close the current channel. A later ping or `remote_handle` call
    /// opens a new one.
    pub fn disconnect(&self) {
        if let Some(connection) = self.inner.current() {
            debug!(name = %self.inner.channel_name, "Disconnecting client");
            connection.disconnect();
        }
    }

    /// Stop listening for pings and close the channel for good.
    pub fn shutdown(&self) {
        self.inner.shut_down();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }
}

impl<C: Connector> fmt::Debug for ClientWrapper<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientWrapper")
            .field("logical_name", &self.inner.logical_name)
            .field("channel_name", &self.inner.channel_name)
            .field("connected", &self.is_connected())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl<C: Connector> Inner<C> {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Connection> {
        self.slot()
            .as_ref()
            .filter(|connection| connection.is_connected())
            .cloned()
    }

    fn ensure_connected(inner: &Arc<Self>) -> Result<Connection> {
        match inner.current() {
            Some(connection) => Ok(connection),
            None => Self::open(inner),
        }
    }

    /// Open a channel and install a connection on it, unless a live one is
    /// already installed.
    fn open(inner: &Arc<Self>) -> Result<Connection> {
        if inner.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }

        let connection = {
            let mut slot = inner.slot();
            if let Some(existing) = slot.as_ref().filter(|c| c.is_connected()) {
                return Ok(existing.clone());
            }

            let channel = inner.connector.connect(&inner.channel_name)?;
            let connection = Connection::new(
                channel,
                inner.surface.clone(),
                inner.connection_options.clone(),
            );
            *slot = Some(connection.clone());
            connection
        };

        info!(
            name = %inner.channel_name,
            connection_id = %connection.id(),
            "Client connected"
        );
        spawn_disconnect_watcher(inner, connection.clone());
        let _ = inner.events.send(ClientEvent::Connected {
            connection_id: connection.id(),
        });

        Ok(connection)
    }

    /// Forget `connection_id` if it is still the installed connection.
    fn clear(&self, connection_id: Uuid) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().map(Connection::id) == Some(connection_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn shut_down(&self) {
        if !self.shutdown.is_cancelled() {
            info!(name = %self.channel_name, "Client shutting down");
        }
        self.shutdown.cancel();
        let current = self.slot().clone();
        if let Some(connection) = current {
            connection.disconnect();
        }
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let slot = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = slot.take() {
            connection.disconnect();
        }
    }
}

fn spawn_disconnect_watcher<C: Connector>(inner: &Arc<Inner<C>>, connection: Connection) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        connection.closed().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let connection_id = connection.id();
        if inner.clear(connection_id) {
            info!(name = %inner.channel_name, connection_id = %connection_id, "Client disconnected");
            let _ = inner
                .events
                .send(ClientEvent::Disconnected { connection_id });
        }
    });
}

fn spawn_ping_listener<C: Connector>(inner: &Arc<Inner<C>>) {
    let mut pings = inner.connector.pings();
    let shutdown = inner.shutdown.clone();
    let weak: Weak<Inner<C>> = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = pings.recv() => received,
            };

            let logical_name = match received {
                Ok(BroadcastMessage::Ping { logical_name }) => logical_name,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed reconnection pings");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let Some(inner) = weak.upgrade() else {
                break;
            };
            if logical_name != inner.logical_name {
                continue;
            }
            if inner.current().is_some() {
                debug!(name = %inner.channel_name, "Ignoring ping, already connected");
                continue;
            }

            info!(name = %inner.channel_name, "Reconnecting after ping");
            if let Err(e) = Inner::open(&inner) {
                warn!(name = %inner.channel_name, error = %e, "Reconnection failed");
            }
        }
        debug!("Ping listener stopped");
    });
}

fn spawn_unload_hook<C: Connector>(inner: &Arc<Inner<C>>, unload: CancellationToken) {
    let shutdown = inner.shutdown.clone();
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = unload.cancelled() => {
                if let Some(inner) = weak.upgrade() {
                    debug!(name = %inner.channel_name, "Unload hook fired");
                    inner.shut_down();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::transport::memory::MemoryHub;
    use protocol::transport::Broadcaster;
    use protocol::Channel;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn client_surface() -> ExposedSurface {
        ExposedSurface::builder()
            .method("whoami", |_| Ok(json!("content")))
            .build()
    }

    fn host_surface() -> ExposedSurface {
        ExposedSurface::builder()
            .method("add", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .build()
    }

    async fn accept(listener: &mut mpsc::UnboundedReceiver<Channel>) -> Connection {
        let channel = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("no channel arrived")
            .expect("listener closed");
        Connection::new(
            channel,
            host_surface(),
            ConnectionOptions {
                has_session_id: false,
                ..ConnectionOptions::default()
            },
        )
    }

    async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event arrived")
            .unwrap()
    }

    #[test]
    fn test_context_channel_names() {
        assert_eq!(
            ClientContext::Session.channel_name("content").encode(),
            "portlink-content"
        );
        assert_eq!(
            ClientContext::Devtools {
                inspected_session: SessionId(4)
            }
            .channel_name("panel")
            .encode(),
            "portlink.nosession-panel-4"
        );
        assert_eq!(
            ClientContext::SessionAgnostic
                .channel_name("popup")
                .encode(),
            "portlink.nosession-popup"
        );
    }

    #[tokio::test]
    async fn test_connect_and_call_host() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let host = accept(&mut listener).await;
        assert_eq!(host.name(), "portlink-content");
        assert_eq!(host.session_id(), Some(SessionId(3)));

        let remote = client.remote_handle().await.unwrap();
        assert_eq!(
            remote.call("add", vec![json!(2), json!(5)]).await.unwrap(),
            Some(json!(7))
        );

        let back = host.remote_handle().await.unwrap();
        assert_eq!(
            back.call("whoami", vec![]).await.unwrap(),
            Some(json!("content"))
        );
    }

    #[tokio::test]
    async fn test_host_disconnect_clears_connection() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let mut events = client.subscribe();
        let host = accept(&mut listener).await;
        let first = client.connection().unwrap().id();

        host.disconnect();
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Disconnected {
                connection_id: first
            }
        );
        assert!(!client.is_connected());
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_ping_reopens_channel() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let mut events = client.subscribe();
        accept(&mut listener).await.disconnect();
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Disconnected { .. }
        ));

        hub.send_to(SessionId(3), &BroadcastMessage::ping("content"))
            .await
            .unwrap();

        let host = accept(&mut listener).await;
        assert_eq!(host.name(), "portlink-content");
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Connected { .. }
        ));
        assert!(client.is_connected());

        let remote = client.remote_handle().await.unwrap();
        assert_eq!(remote.call("add", vec![json!(1)]).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_ping_for_other_name_is_ignored() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let mut events = client.subscribe();
        accept(&mut listener).await.disconnect();
        next_event(&mut events).await;

        hub.send_to(SessionId(3), &BroadcastMessage::ping("panel"))
            .await
            .unwrap();

        let reopened = tokio::time::timeout(Duration::from_millis(100), listener.recv()).await;
        assert!(reopened.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_ping_while_connected_opens_nothing() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let _host = accept(&mut listener).await;
        let first = client.connection().unwrap().id();

        hub.send_to(SessionId(3), &BroadcastMessage::ping("content"))
            .await
            .unwrap();

        let reopened = tokio::time::timeout(Duration::from_millis(100), listener.recv()).await;
        assert!(reopened.is_err());
        assert_eq!(client.connection().unwrap().id(), first);
    }

    #[tokio::test]
    async fn test_remote_handle_reopens_after_disconnect() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions::default(),
        )
        .unwrap();
        let _first_host = accept(&mut listener).await;
        client.disconnect();
        assert!(!client.is_connected());

        let reconnect = tokio::spawn({
            let client = client.clone();
            async move {
                let remote = client.remote_handle().await?;
                remote.call("add", vec![json!(4), json!(4)]).await.map_err(ClientError::from)
            }
        });

        let _second_host = accept(&mut listener).await;
        assert_eq!(reconnect.await.unwrap().unwrap(), Some(json!(8)));
    }

    #[tokio::test]
    async fn test_unload_hook_shuts_down() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();
        let unload = CancellationToken::new();

        let client = ClientWrapper::connect(
            "content",
            client_surface(),
            hub.endpoint(Some(SessionId(3))),
            ClientOptions {
                unload: Some(unload.clone()),
                ..ClientOptions::default()
            },
        )
        .unwrap();
        let host = accept(&mut listener).await;

        unload.cancel();
        tokio::time::timeout(Duration::from_secs(5), host.closed())
            .await
            .unwrap();
        assert!(client.is_shut_down());
        assert!(!client.is_connected());

        // Pings no longer bring it back. Nobody may be listening anymore.
        let _ = hub
            .send_to(SessionId(3), &BroadcastMessage::ping("content"))
            .await;
        let reopened = tokio::time::timeout(Duration::from_millis(100), listener.recv()).await;
        assert!(reopened.is_err());
        assert!(matches!(
            client.remote_handle().await,
            Err(ClientError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_channel() {
        let hub = MemoryHub::new();
        let mut listener = hub.listen();

        let client = ClientWrapper::connect(
            "popup",
            client_surface(),
            hub.endpoint(None),
            ClientOptions {
                context: ClientContext::SessionAgnostic,
                ..ClientOptions::default()
            },
        )
        .unwrap();
        let host = accept(&mut listener).await;
        assert_eq!(host.name(), "portlink.nosession-popup");

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), host.closed())
            .await
            .unwrap();
    }
}
