//! Host-side registry of live connections.
//!
//! Every inbound channel is filed under the [`Address`] decoded from its
//! handshake name. At most one connection may hold an address at a time;
//! a second channel claiming it is disconnected and reported with
//! `ID_TAKEN`. Connections of the same logical name and session form a
//! frame group: losing the base frame takes the whole group down, and a
//! periodic sweep drops groups whose base frame never arrived.
//!
//! The session-bound part of the registry is persisted. On start the
//! registry pings every stored client so those still alive reconnect, and
//! holds back lookups until that pass is over.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use protocol::{
    Address, BroadcastMessage, Broadcaster, Channel, ChannelName, Connection, ConnectionOptions,
    ExposedSurface, FrameId, RemoteHandle, SessionId,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError, DEFAULT_STORAGE_KEY};
use crate::store::{load_address_set, save_address_set, KeyValueStore, PersistedAddress};

/// Capacity of the registry event channel.
const EVENT_CAPACITY: usize = 256;

/// Errors reported by the registry. None of them are fatal.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another connection already holds this address.
    #[error("The id '{address}' has already been taken. It must be unique.")]
    AddressConflict { address: Address },

    /// A lookup found nothing at this address.
    #[error("There is no connection registered under '{address}'")]
    NoSuchConnection { address: Address },

    /// Reading or writing the persisted address set failed.
    #[error("persistence failed: {0}")]
    Store(String),
}

impl RegistryError {
    /// Stable code identifying the kind of failure.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::AddressConflict { .. } => "ID_TAKEN",
            RegistryError::NoSuchConnection { .. } => "NO_CONNECTION",
            RegistryError::Store(_) => "STORE_FAILURE",
        }
    }
}

/// Receives registry errors instead of the log.
pub type ErrorCallback = Arc<dyn Fn(&RegistryError) + Send + Sync>;

/// Registry lifecycle notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A channel was accepted and filed under `address`.
    ConnectionReceived {
        address: Address,
        connection: Connection,
    },
    /// The connection at `address` is gone.
    ConnectionEnded { address: Address },
    /// The startup reconnection pass finished.
    RestorationFinished { restored: usize, dropped: usize },
}

/// Registry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    /// Address by frame too. When off, every connection lives in the base frame.
    pub multi_frame: bool,
    /// Period of the orphaned-frame sweep.
    pub eviction_interval: Duration,
    /// Store key of the persisted address set.
    pub storage_key: String,
    /// Ping stored clients when the registry starts.
    pub restore_on_start: bool,
    /// Options for every accepted connection.
    pub connection: ConnectionOptions,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            multi_frame: true,
            eviction_interval: Duration::from_secs(30),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            restore_on_start: true,
            connection: ConnectionOptions {
                has_session_id: false,
                request_timeout: None,
            },
        }
    }
}

impl RegistryOptions {
    /// Registry settings from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            multi_frame: config.registry.multi_frame,
            eviction_interval: config.registry.eviction_interval(),
            storage_key: config.registry.storage_key.clone(),
            restore_on_start: config.registry.restore_on_start,
            connection: ConnectionOptions {
                has_session_id: false,
                request_timeout: config.connection.request_timeout(),
            },
        })
    }
}

/// Connections sharing a logical name and session, by frame.
struct FrameGroup {
    logical_name: String,
    session_id: Option<SessionId>,
    frames: HashMap<FrameId, Connection>,
}

impl FrameGroup {
    fn new(address: &Address) -> Self {
        Self {
            logical_name: address.logical_name.clone(),
            session_id: address.session_id,
            frames: HashMap::new(),
        }
    }

    fn address(&self, frame_id: &FrameId) -> Address {
        Address::new(self.logical_name.clone(), self.session_id).with_frame(frame_id.clone())
    }

    fn has_base(&self) -> bool {
        self.frames.contains_key(&FrameId::base())
    }

    fn into_entries(self) -> Vec<(Address, Connection)> {
        let base = Address::new(self.logical_name, self.session_id);
        self.frames
            .into_iter()
            .map(|(frame_id, connection)| (base.clone().with_frame(frame_id), connection))
            .collect()
    }
}

struct RegistryInner<S, B> {
    surface: ExposedSurface,
    options: RegistryOptions,
    store: S,
    broadcaster: B,
    groups: dashmap::DashMap<String, FrameGroup>,
    restoring: watch::Sender<bool>,
    events: broadcast::Sender<RegistryEvent>,
    on_error: RwLock<Option<ErrorCallback>>,
    persist_lock: Mutex<()>,
    shutdown: CancellationToken,
}

/// Registry of live connections, keyed by address.
pub struct ConnectionRegistry<S, B> {
    inner: Arc<RegistryInner<S, B>>,
}

impl<S, B> Clone for ConnectionRegistry<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyValueStore, B: Broadcaster> ConnectionRegistry<S, B> {
    /// Creates a registry serving `surface` on every accepted connection.
    ///
    /// With `restore_on_start`, lookups wait until [`start`](Self::start)
    /// has finished pinging stored clients.
    pub fn new(surface: ExposedSurface, options: RegistryOptions, store: S, broadcaster: B) -> Self {
        let (restoring, _) = watch::channel(options.restore_on_start);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(RegistryInner {
                surface,
                options,
                store,
                broadcaster,
                groups: dashmap::DashMap::new(),
                restoring,
                events,
                on_error: RwLock::new(None),
                persist_lock: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Route errors to `callback` instead of the log.
    pub fn with_error_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&RegistryError) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Start accepting channels and the background tasks.
    pub fn start(&self, mut incoming: mpsc::UnboundedReceiver<Channel>) {
        info!(
            multi_frame = self.inner.options.multi_frame,
            restore = self.inner.options.restore_on_start,
            "Starting connection registry"
        );

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.inner.shutdown.cancelled() => break,
                    channel = incoming.recv() => match channel {
                        Some(channel) => {
                            registry.accept(channel).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Accept loop stopped");
        });

        if self.inner.options.multi_frame && self.inner.options.eviction_interval.is_zero() {
            error!("Eviction interval is zero, orphaned frames will not be evicted");
        } else if self.inner.options.multi_frame {
            let registry = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(registry.inner.options.eviction_interval);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = registry.inner.shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            registry.evict_orphaned_frames().await;
                        }
                    }
                }
            });
        }

        if self.inner.options.restore_on_start {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.restore().await;
            });
        }
    }

    /// Stop background tasks and disconnect every connection.
    ///
    /// The persisted address set is left as it is, so the next start can
    /// ping those clients.
    pub fn shutdown(&self) {
        info!("Shutting down connection registry");
        self.inner.shutdown.cancel();

        let connections: Vec<Connection> = self
            .inner
            .groups
            .iter()
            .flat_map(|group| group.frames.values().cloned().collect::<Vec<_>>())
            .collect();
        for connection in connections {
            connection.disconnect();
        }
    }

    /// File an inbound channel. Returns the new connection when accepted.
    pub async fn accept(&self, channel: Channel) -> Option<Connection> {
        let (address, connection) = self.register(channel)?;

        let registry = self.clone();
        let watched = connection.clone();
        let watched_address = address.clone();
        tokio::spawn(async move {
            watched.closed().await;
            registry
                .handle_disconnect(&watched_address, watched.id())
                .await;
        });

        self.persist().await;
        let _ = self.inner.events.send(RegistryEvent::ConnectionReceived {
            address,
            connection: connection.clone(),
        });
        Some(connection)
    }

    fn register(&self, channel: Channel) -> Option<(Address, Connection)> {
        let Some(name) = ChannelName::parse(channel.name()) else {
            debug!(name = %channel.name(), "Ignoring channel with a foreign name");
            return None;
        };

        let mut address = name.address(channel.session_id());
        if !self.inner.options.multi_frame {
            address.frame_id = FrameId::base();
        }

        let mut group = self
            .inner
            .groups
            .entry(address.key())
            .or_insert_with(|| FrameGroup::new(&address));

        if group.frames.contains_key(&address.frame_id) {
            drop(group);
            channel.sink().disconnect();
            warn!(address = %address, "Rejecting channel for an address already in use");
            self.report(RegistryError::AddressConflict { address });
            return None;
        }

        let connection = Connection::new(
            channel,
            self.inner.surface.clone(),
            self.inner.options.connection.clone(),
        );
        group
            .frames
            .insert(address.frame_id.clone(), connection.clone());
        drop(group);

        info!(
            address = %address,
            connection_id = %connection.id(),
            "Connection registered"
        );
        Some((address, connection))
    }

    /// Remove the connection `connection_id` from `address`.
    ///
    /// Nothing happens when a newer connection holds the address by now.
    async fn handle_disconnect(&self, address: &Address, connection_id: Uuid) {
        let key = address.key();
        let holds = |group: &FrameGroup, frame_id: &FrameId| {
            group
                .frames
                .get(frame_id)
                .is_some_and(|connection| connection.id() == connection_id)
        };

        let removed = if address.is_base() {
            self.inner
                .groups
                .remove_if(&key, |_, group| holds(group, &address.frame_id))
                .map(|(_, group)| group.into_entries())
                .unwrap_or_default()
        } else {
            let mut removed = Vec::new();
            if let Some(mut group) = self.inner.groups.get_mut(&key) {
                if holds(&*group, &address.frame_id) {
                    if let Some(connection) = group.frames.remove(&address.frame_id) {
                        removed.push((address.clone(), connection));
                    }
                }
            }
            self.inner
                .groups
                .remove_if(&key, |_, group| group.frames.is_empty());
            removed
        };

        if removed.is_empty() {
            debug!(address = %address, "Ignoring disconnect of a replaced connection");
            return;
        }

        self.end_all(removed);
        self.persist().await;
    }

    /// Drop frame groups whose base frame is gone. Returns how many
    /// connections were removed.
    pub async fn evict_orphaned_frames(&self) -> usize {
        let orphaned: Vec<String> = self
            .inner
            .groups
            .iter()
            .filter(|group| !group.has_base())
            .map(|group| group.key().clone())
            .collect();

        let mut removed = Vec::new();
        for key in orphaned {
            if let Some((_, group)) = self.inner.groups.remove_if(&key, |_, group| !group.has_base()) {
                removed.extend(group.into_entries());
            }
        }

        let count = removed.len();
        if count > 0 {
            info!(count, "Evicting frames without a base frame");
            self.end_all(removed);
            self.persist().await;
        }
        count
    }

    fn end_all(&self, removed: Vec<(Address, Connection)>) {
        for (address, connection) in removed {
            connection.disconnect();
            info!(address = %address, connection_id = %connection.id(), "Connection ended");
            let _ = self
                .inner
                .events
                .send(RegistryEvent::ConnectionEnded { address });
        }
    }

    /// Ping every stored client, keep those that are still reachable.
    async fn restore(&self) {
        let key = &self.inner.options.storage_key;
        let stored = match load_address_set(&self.inner.store, key).await {
            Ok(stored) => stored,
            Err(err) => {
                self.report(RegistryError::Store(format!("{err:#}")));
                Vec::new()
            }
        };

        let broadcaster = &self.inner.broadcaster;
        let pings = stored.into_iter().map(|entry| async move {
            let ping = BroadcastMessage::ping(entry.logical_name.clone());
            let result = broadcaster.send_to(entry.session_id, &ping).await;
            (entry, result)
        });

        let mut survivors = Vec::new();
        let mut dropped = 0;
        for (entry, result) in join_all(pings).await {
            match result {
                Ok(()) => survivors.push(entry),
                Err(err) => {
                    debug!(
                        logical_name = %entry.logical_name,
                        session_id = %entry.session_id,
                        error = %err,
                        "Dropping unreachable stored connection"
                    );
                    dropped += 1;
                }
            }
        }
        let restored = survivors.len();

        {
            let _guard = self.inner.persist_lock.lock().await;
            let mut merged = survivors;
            for current in self.persisted_addresses() {
                if !merged.contains(&current) {
                    merged.push(current);
                }
            }
            if let Err(err) = save_address_set(&self.inner.store, key, &merged).await {
                self.report(RegistryError::Store(format!("{err:#}")));
            }
            // Lifted under the lock so no membership change slips between
            // the merge and the first regular write.
            self.inner.restoring.send_replace(false);
        }

        info!(restored, dropped, "Restoration finished");
        let _ = self
            .inner
            .events
            .send(RegistryEvent::RestorationFinished { restored, dropped });
    }

    async fn persist(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let _guard = self.inner.persist_lock.lock().await;
        // The stored set is still unread; restoration writes the merged set.
        if self.is_restoring() {
            debug!("Deferring persistence until restoration finishes");
            return;
        }
        let addresses = self.persisted_addresses();
        if let Err(err) =
            save_address_set(&self.inner.store, &self.inner.options.storage_key, &addresses).await
        {
            self.report(RegistryError::Store(format!("{err:#}")));
        }
    }

    /// Session-bound groups, one entry per key, sorted.
    fn persisted_addresses(&self) -> Vec<PersistedAddress> {
        let mut addresses: Vec<PersistedAddress> = self
            .inner
            .groups
            .iter()
            .filter_map(|group| {
                group
                    .session_id
                    .map(|session| PersistedAddress::new(group.logical_name.clone(), session))
            })
            .collect();
        addresses.sort_by(|a, b| {
            (&a.logical_name, a.session_id).cmp(&(&b.logical_name, b.session_id))
        });
        addresses
    }

    fn report(&self, err: RegistryError) {
        let callback = self
            .inner
            .on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(&err),
            None => error!(code = err.code(), error = %err, "Registry error"),
        }
    }

    /// Resolves once the startup reconnection pass is over.
    pub async fn wait_for_restoration(&self) {
        let mut restoring = self.inner.restoring.subscribe();
        let _ = restoring
            .wait_for(|restoring| !*restoring)
            .await
            .map(|_| ());
    }

    /// Handle to the connection at the given address.
    ///
    /// Reports `NO_CONNECTION` and returns `None` when nothing is there.
    pub async fn get_connection(
        &self,
        logical_name: &str,
        session_id: Option<SessionId>,
        frame_id: Option<FrameId>,
    ) -> Option<RemoteHandle> {
        self.wait_for_restoration().await;

        let mut address = Address::new(logical_name, session_id);
        if self.inner.options.multi_frame {
            if let Some(frame_id) = frame_id {
                address = address.with_frame(frame_id);
            }
        }

        let Some(connection) = self.connection_at(&address) else {
            self.report(RegistryError::NoSuchConnection { address });
            return None;
        };

        match connection.remote_handle().await {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(address = %address, error = %err, "Handshake with registered connection failed");
                None
            }
        }
    }

    /// Sessions that hold a connection with exactly this logical name.
    pub async fn connected_sessions(&self, logical_name: &str) -> Vec<SessionId> {
        self.wait_for_restoration().await;

        let mut sessions: Vec<SessionId> = self
            .inner
            .groups
            .iter()
            .filter(|group| group.logical_name == logical_name)
            .filter_map(|group| group.session_id)
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    /// The connection at `address`, without waiting for restoration.
    pub fn connection_at(&self, address: &Address) -> Option<Connection> {
        self.inner
            .groups
            .get(&address.key())
            .and_then(|group| group.frames.get(&address.frame_id).cloned())
    }

    pub fn has_connection(&self, address: &Address) -> bool {
        self.connection_at(address).is_some()
    }

    /// Number of registered connections across all frames.
    pub fn connection_count(&self) -> usize {
        self.inner.groups.iter().map(|group| group.frames.len()).sum()
    }

    /// Every registered address, sorted by display form.
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .inner
            .groups
            .iter()
            .flat_map(|group| {
                group
                    .frames
                    .keys()
                    .map(|frame_id| group.address(frame_id))
                    .collect::<Vec<_>>()
            })
            .collect();
        addresses.sort_by_key(|address| address.to_string());
        addresses
    }

    pub fn is_restoring(&self) -> bool {
        *self.inner.restoring.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }
}
