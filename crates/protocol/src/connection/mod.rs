//! A live RPC session over one channel.
//!
//! A [`Connection`] owns one channel end. It answers the peer's requests from
//! an [`ExposedSurface`], correlates replies to its own requests by id, and
//! performs the symmetric `bootstrap` handshake that tells each side which
//! methods the other exposes.
//!
//! A connection is created the instant its channel becomes available and is
//! never reused: once the channel closes, every waiting request fails with
//! [`RpcError::Disconnected`] and a single [`ConnectionEvent::Disconnected`]
//! is emitted.

pub mod handle;
mod pending;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::SessionId;
use crate::error::{ProtocolError, RpcError, RpcResult};
use crate::messages::{self, Message, MessageBody, RequestId};
use crate::surface::{ExposedSurface, MethodOutcome, MethodResult};
use crate::transport::{Channel, ChannelSink};

pub use handle::RemoteHandle;
use pending::{Completion, PendingRequests};

/// Capacity of the per-connection event channel.
const EVENT_CAPACITY: usize = 64;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Whether this side lives in a session the peer can report back.
    /// When false, `my_session_id` resolves to `None` without asking.
    pub has_session_id: bool,
    /// Give up on a reply after this long. `None` waits until the
    /// connection closes.
    pub request_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            has_session_id: true,
            request_timeout: None,
        }
    }
}

/// Lifecycle notifications of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The peer reported its exposed methods.
    Ready { remote_methods: Vec<String> },
    /// The peer answered a request with an `error` message.
    RemoteError { id: RequestId, error: Value },
    /// The channel closed. Emitted once.
    Disconnected,
}

struct Inner {
    id: Uuid,
    name: String,
    session_id: Option<SessionId>,
    sink: Arc<dyn ChannelSink>,
    surface: ExposedSurface,
    options: ConnectionOptions,
    pending: PendingRequests,
    remote: watch::Sender<Option<Arc<[String]>>>,
    closed: CancellationToken,
    disconnected: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

/// One end of an RPC session. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take ownership of a channel end and start serving it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(channel: Channel, surface: ExposedSurface, options: ConnectionOptions) -> Self {
        let (name, session_id, sink, inbound) = channel.into_parts();
        let (remote, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            name,
            session_id,
            sink,
            surface,
            options,
            pending: PendingRequests::new(),
            remote,
            closed: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
            events,
        });

        debug!(
            connection_id = %inner.id,
            name = %inner.name,
            session_id = ?inner.session_id,
            "Connection opened"
        );

        tokio::spawn(run(Arc::clone(&inner), inbound));

        Self { inner }
    }

    /// Unique id of this connection instance.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Handshake name of the underlying channel.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The peer's session as seen by this end.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn surface(&self) -> &ExposedSurface {
        &self.inner.surface
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled() && self.inner.sink.is_connected()
    }

    /// Methods the peer reported, once a handshake completed.
    pub fn remote_methods(&self) -> Option<Vec<String>> {
        self.inner
            .remote
            .borrow()
            .as_ref()
            .map(|methods| methods.to_vec())
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close the channel. Idempotent.
    pub fn disconnect(&self) {
        self.inner.mark_disconnected();
    }

    /// Send `bootstrap` and wait until the peer's surface is known.
    ///
    /// Completes on the matching `bootstrap-answer` or on an incoming
    /// `bootstrap`, whichever is processed first.
    pub async fn initiate_handshake(&self) -> RpcResult<RemoteHandle> {
        let mut remote = self.inner.remote.subscribe();
        let reply = self.send_request(MessageBody::Bootstrap {
            exposed_methods: self.inner.surface.method_names(),
        })?;

        tokio::select! {
            result = reply => {
                result?;
            }
            known = async { remote.wait_for(Option::is_some).await.map(|_| ()) } => {
                known.map_err(|_| RpcError::Disconnected)?;
            }
        }

        Ok(RemoteHandle::new(self.clone()))
    }

    /// The peer's handle, handshaking first if its surface is not known yet.
    pub async fn remote_handle(&self) -> RpcResult<RemoteHandle> {
        if self.inner.remote.borrow().is_some() {
            return Ok(RemoteHandle::new(self.clone()));
        }
        self.initiate_handshake().await
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, body: MessageBody) -> RpcResult<Option<Value>> {
        self.send_request(body)?.await
    }

    /// Send a request now and return the future of its reply.
    ///
    /// The message is posted before this returns, so dropping the future
    /// only discards the reply.
    pub fn send_request(
        &self,
        body: MessageBody,
    ) -> RpcResult<BoxFuture<'static, RpcResult<Option<Value>>>> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }

        let (id, reply) = self.inner.pending.register();
        debug!(connection_id = %self.inner.id, id, kind = body.kind(), "Sending request");
        if let Err(err) = self.inner.post(Message::new(id, body)) {
            self.inner.pending.cancel(id);
            return Err(err.into());
        }

        let inner = Arc::clone(&self.inner);
        Ok(async move {
            let completion = match inner.options.request_timeout {
                Some(after) => match tokio::time::timeout(after, reply).await {
                    Ok(received) => received,
                    Err(_) => {
                        inner.pending.cancel(id);
                        warn!(connection_id = %inner.id, id, ?after, "Request timed out");
                        return Err(RpcError::Timeout { id, after });
                    }
                },
                None => reply.await,
            };

            match completion {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(RpcError::Remote(error)),
                Err(_) => Err(RpcError::Disconnected),
            }
        }
        .boxed())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("session_id", &self.inner.session_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Closes the connection when the dispatch task ends, including by unwinding.
struct CloseOnExit(Arc<Inner>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.mark_disconnected();
    }
}

async fn run(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<Value>) {
    let _close = CloseOnExit(Arc::clone(&inner));
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            value = inbound.recv() => match value {
                Some(value) => inner.dispatch(value),
                None => break,
            },
        }
    }
}

/// Error value reported to the caller of a method that panicked.
fn panic_error(payload: Box<dyn Any + Send>) -> Value {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "exposed method panicked".to_string());
    Value::String(message)
}

impl Inner {
    fn dispatch(self: &Arc<Self>, value: Value) {
        let Message { id, body } = match messages::decode(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id = %self.id, error = %err, "Dropping malformed message");
                return;
            }
        };

        debug!(connection_id = %self.id, id, kind = body.kind(), "Received message");

        match body {
            MessageBody::Bootstrap { exposed_methods } => {
                self.set_remote(exposed_methods);
                self.reply(
                    id,
                    MessageBody::BootstrapAnswer {
                        exposed_methods: self.surface.method_names(),
                    },
                );
            }
            MessageBody::BootstrapAnswer { exposed_methods } => {
                self.set_remote(exposed_methods);
                self.pending.complete(id, Ok(None));
            }
            MessageBody::Get { prop } => {
                self.reply(id, MessageBody::answer(self.surface.get_property(&prop)));
            }
            MessageBody::Set { prop, value } => {
                self.reply(id, MessageBody::answer(self.surface.set_property(&prop, value)));
            }
            MessageBody::Call { name, args } => self.call(id, name, args),
            MessageBody::Answer { result } => self.settle(id, Ok(result)),
            MessageBody::Error { error } => {
                warn!(connection_id = %self.id, id, error = %error, "Peer reported an error");
                self.settle(id, Err(error.clone()));
                let _ = self.events.send(ConnectionEvent::RemoteError { id, error });
            }
            MessageBody::RequestId => {
                let session = self.session_id.map_or(Value::Null, |session| Value::from(session.0));
                self.reply(id, MessageBody::answer(Some(session)));
            }
        }
    }

    fn call(self: &Arc<Self>, id: RequestId, name: String, args: Vec<Value>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.surface.invoke(&name, args)))
            .unwrap_or_else(|payload| Some(MethodOutcome::Immediate(Err(panic_error(payload)))));

        match outcome {
            None => {
                debug!(connection_id = %self.id, id, method = %name, "Call to unknown method");
                self.reply(id, MessageBody::answer(None));
            }
            Some(MethodOutcome::Immediate(result)) => {
                let reply = self.method_reply(id, &name, result);
                self.reply(id, reply);
            }
            Some(MethodOutcome::Deferred(future)) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(future)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panic_error(payload)));
                    let reply = inner.method_reply(id, &name, result);
                    inner.reply(id, reply);
                });
            }
        }
    }

    fn method_reply(&self, id: RequestId, name: &str, result: MethodResult) -> MessageBody {
        match result {
            Ok(value) => MessageBody::answer(Some(value)),
            Err(error) => {
                error!(connection_id = %self.id, id, method = %name, error = %error, "Exposed method failed");
                MessageBody::Error { error }
            }
        }
    }

    fn settle(&self, id: RequestId, completion: Completion) {
        if !self.pending.complete(id, completion) {
            warn!(connection_id = %self.id, id, "Reply matches no pending request");
        }
    }

    fn set_remote(&self, methods: Vec<String>) {
        debug!(connection_id = %self.id, methods = ?methods, "Peer surface received");
        self.remote.send_replace(Some(Arc::from(methods.clone())));
        let _ = self.events.send(ConnectionEvent::Ready {
            remote_methods: methods,
        });
    }

    fn reply(&self, id: RequestId, body: MessageBody) {
        if let Err(err) = self.post(Message::new(id, body)) {
            debug!(connection_id = %self.id, id, error = %err, "Reply not delivered");
        }
    }

    fn post(&self, message: Message) -> crate::error::Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ChannelClosed(
                "connection is disconnected".to_string(),
            ));
        }
        self.sink.post(messages::encode(&message)?)
    }

    fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        self.pending.clear();
        self.sink.disconnect();
        info!(connection_id = %self.id, name = %self.name, "Connection closed");
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::channel_pair;
    use serde_json::json;

    fn host_surface() -> ExposedSurface {
        ExposedSurface::builder()
            .method("add", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .method("fail", |_| Err(json!("boom")))
            .async_method("never", |_| futures_util::future::pending())
            .async_method("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!("late"))
            })
            .property("variable", json!(1))
            .build()
    }

    fn connect(options: ConnectionOptions) -> (Connection, Connection) {
        let (accepting, opening) = channel_pair("portlink-test", Some(SessionId(4)));
        let host = Connection::new(
            accepting,
            host_surface(),
            ConnectionOptions {
                has_session_id: false,
                ..ConnectionOptions::default()
            },
        );
        let client_surface = ExposedSurface::builder()
            .method("ping", |_| Ok(json!("pong")))
            .build();
        let client = Connection::new(opening, client_surface, options);
        (host, client)
    }

    #[tokio::test]
    async fn test_handshake_informs_both_sides() {
        let (host, client) = connect(ConnectionOptions::default());

        let remote = client.remote_handle().await.unwrap();
        assert_eq!(remote.remote_methods(), vec!["add", "fail", "never", "slow"]);
        assert_eq!(host.remote_methods(), Some(vec!["ping".to_string()]));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_simultaneous_handshakes_both_complete() {
        let (host, client) = connect(ConnectionOptions::default());
        let (a, b) = tokio::join!(host.initiate_handshake(), client.initiate_handshake());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(host.remote_methods().is_some());
        assert!(client.remote_methods().is_some());
    }

    #[tokio::test]
    async fn test_unknown_method_answers_undefined() {
        let (_host, client) = connect(ConnectionOptions::default());
        let result = client
            .request(MessageBody::Call {
                name: "missing".to_string(),
                args: vec![],
            })
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_remote_failure_reaches_caller_and_events() {
        let (_host, client) = connect(ConnectionOptions::default());
        let mut events = client.subscribe();

        let result = client
            .request(MessageBody::Call {
                name: "fail".to_string(),
                args: vec![],
            })
            .await;
        assert!(matches!(result, Err(RpcError::Remote(ref e)) if e == &json!("boom")));

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectionEvent::RemoteError {
                id: 1,
                error: json!("boom")
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (host, client) = connect(ConnectionOptions::default());

        let reply = client
            .send_request(MessageBody::Call {
                name: "never".to_string(),
                args: vec![],
            })
            .unwrap();
        assert_eq!(client.pending_requests(), 1);

        host.disconnect();
        assert!(matches!(reply.await, Err(RpcError::Disconnected)));
        client.closed().await;
        assert_eq!(client.pending_requests(), 0);
        assert!(!client.is_connected());

        let after = client.request(MessageBody::RequestId).await;
        assert!(matches!(after, Err(RpcError::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_clears_entry() {
        let (_host, client) = connect(ConnectionOptions {
            request_timeout: Some(Duration::from_millis(50)),
            ..ConnectionOptions::default()
        });

        let result = client
            .request(MessageBody::Call {
                name: "slow".to_string(),
                args: vec![],
            })
            .await;
        assert!(matches!(
            result,
            Err(RpcError::Timeout { id: 1, after }) if after == Duration::from_millis(50)
        ));
        assert_eq!(client.pending_requests(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnected_event_fires_once() {
        let (host, _client) = connect(ConnectionOptions::default());
        let mut events = host.subscribe();

        host.disconnect();
        host.disconnect();
        host.closed().await;

        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wire_level_dispatch() {
        let (accepting, opening) = channel_pair("portlink-raw", Some(SessionId(8)));
        let host = Connection::new(accepting, host_surface(), ConnectionOptions::default());
        let (_, _, sink, mut inbound) = opening.into_parts();

        sink.post(json!({"id": 1, "type": "teleport"})).unwrap();
        sink.post(json!("not even a record")).unwrap();

        sink.post(json!({"id": 2, "type": "get", "prop": "variable"})).unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(json!({"id": 2, "type": "answer", "result": 1}))
        );

        sink.post(json!({"id": 3, "type": "set", "prop": "nope", "value": 5}))
            .unwrap();
        assert_eq!(inbound.recv().await, Some(json!({"id": 3, "type": "answer"})));
        assert!(!host.surface().has_property("nope"));

        sink.post(json!({"id": 4, "type": "request-id"})).unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(json!({"id": 4, "type": "answer", "result": 8}))
        );

        sink.post(json!({"id": 5, "type": "bootstrap", "exposedMethods": ["x"]}))
            .unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(json!({
                "id": 5,
                "type": "bootstrap-answer",
                "exposedMethods": ["add", "fail", "never", "slow"]
            }))
        );
        assert_eq!(host.remote_methods(), Some(vec!["x".to_string()]));

        sink.post(json!({"id": 6, "type": "call", "name": "add", "args": [1, 2]}))
            .unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(json!({"id": 6, "type": "answer", "result": 3}))
        );
    }

    async fn explode_later() -> MethodResult {
        tokio::task::yield_now().await;
        panic!("late bug")
    }

    #[tokio::test]
    async fn test_panicking_method_answers_with_error() {
        let surface = ExposedSurface::builder()
            .method("boom", |_| panic!("user bug"))
            .async_method("boom_later", |_| explode_later())
            .method("add", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .build();
        let (accepting, opening) = channel_pair("portlink-test", None);
        let host = Connection::new(accepting, surface, ConnectionOptions::default());
        let client = Connection::new(opening, ExposedSurface::empty(), ConnectionOptions::default());
        let mut host_events = host.subscribe();

        let remote = client.remote_handle().await.unwrap();
        let err = remote.call("boom", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref value) if *value == json!("user bug")));
        let err = remote.call("boom_later", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref value) if *value == json!("late bug")));

        // The connection keeps serving after the panics.
        assert_eq!(
            remote.call("add", vec![json!(1), json!(2)]).await.unwrap(),
            Some(json!(3))
        );
        assert!(host.is_connected());
        assert_eq!(client.pending_requests(), 0);
        while let Ok(event) = host_events.try_recv() {
            assert_ne!(event, ConnectionEvent::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (accepting, opening) = channel_pair("portlink-raw", None);
        let host = Connection::new(accepting, host_surface(), ConnectionOptions::default());
        let (_, _, sink, _inbound) = opening.into_parts();

        sink.disconnect();
        host.closed().await;
        assert!(!host.is_connected());
    }
}
