//! Proxy onto the peer's exposed surface.
//!
//! A [`RemoteHandle`] turns local operations into requests: methods the peer
//! reported during the handshake become calls, any other name is treated as
//! a property and read or written over the wire.

use std::fmt;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::Connection;
use crate::address::SessionId;
use crate::error::{RpcError, RpcResult};
use crate::messages::MessageBody;
use crate::surface::{GET_MY_SESSION_ID, THEN};

/// Key used to look up a member on a remote handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKey {
    /// An ordinary string name.
    Name(String),
    /// A non-string key. Cannot be sent to the peer.
    Symbol(String),
}

impl PropertyKey {
    fn into_name(self) -> RpcResult<String> {
        match self {
            PropertyKey::Name(name) => Ok(name),
            PropertyKey::Symbol(description) => Err(RpcError::Unsupported(format!(
                "symbol keys cannot be sent to the peer: {description}"
            ))),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::Name(name.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(name)
    }
}

/// What a member lookup resolved to.
pub enum Member {
    /// Nothing; the handle is not awaitable.
    Undefined,
    /// The caller's own session id, as the peer sees it.
    SessionId(SessionIdGetter),
    /// A method the peer exposes.
    Method(RemoteMethod),
    /// A property read, already sent.
    Property(BoxFuture<'static, RpcResult<Option<Value>>>),
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Undefined => f.write_str("Undefined"),
            Member::SessionId(_) => f.write_str("SessionId(..)"),
            Member::Method(method) => f.debug_tuple("Method").field(&method.name).finish(),
            Member::Property(_) => f.write_str("Property(..)"),
        }
    }
}

/// Handle to the peer's surface, available after a successful handshake.
#[derive(Clone, Debug)]
pub struct RemoteHandle {
    connection: Connection,
}

impl RemoteHandle {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Call a remote method. `None` when the peer has no such method.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> RpcResult<Option<Value>> {
        self.connection
            .request(MessageBody::Call {
                name: name.to_string(),
                args,
            })
            .await
    }

    /// Read a remote property. `None` when the peer does not expose it.
    pub async fn get(&self, name: &str) -> RpcResult<Option<Value>> {
        self.connection
            .request(MessageBody::Get {
                prop: name.to_string(),
            })
            .await
    }

    /// Write a remote property and wait for the applied value.
    pub async fn set(&self, name: &str, value: Value) -> RpcResult<Option<Value>> {
        self.connection
            .request(MessageBody::Set {
                prop: name.to_string(),
                value,
            })
            .await
    }

    /// Write a remote property without waiting for the answer.
    pub fn assign(&self, key: impl Into<PropertyKey>, value: Value) -> RpcResult<()> {
        let prop = key.into().into_name()?;
        let reply = self
            .connection
            .send_request(MessageBody::Set { prop: prop.clone(), value })?;

        tokio::spawn(async move {
            if let Err(err) = reply.await {
                debug!(prop = %prop, error = %err, "Property assignment got no answer");
            }
        });
        Ok(())
    }

    /// This side's session id as the peer sees it.
    pub async fn my_session_id(&self) -> RpcResult<Option<SessionId>> {
        if !self.connection.options().has_session_id {
            return Ok(None);
        }
        let answer = self.connection.request(MessageBody::RequestId).await?;
        Ok(answer.as_ref().and_then(Value::as_u64).map(SessionId))
    }

    /// Resolve a member by key.
    pub fn member(&self, key: impl Into<PropertyKey>) -> RpcResult<Member> {
        let name = key.into().into_name()?;

        if name == THEN {
            return Ok(Member::Undefined);
        }
        if name == GET_MY_SESSION_ID {
            return Ok(Member::SessionId(SessionIdGetter {
                handle: self.clone(),
            }));
        }
        if self.has_method(&name) {
            return Ok(Member::Method(RemoteMethod {
                handle: self.clone(),
                name,
            }));
        }

        let reply = self.connection.send_request(MessageBody::Get { prop: name })?;
        Ok(Member::Property(reply))
    }

    /// Methods the peer reported.
    pub fn remote_methods(&self) -> Vec<String> {
        self.connection.remote_methods().unwrap_or_default()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.connection
            .remote_methods()
            .is_some_and(|methods| methods.iter().any(|method| method == name))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// A remote method bound to its handle.
#[derive(Clone, Debug)]
pub struct RemoteMethod {
    handle: RemoteHandle,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> RpcResult<Option<Value>> {
        self.handle.call(&self.name, args).await
    }
}

/// Deferred `request-id` lookup.
#[derive(Clone, Debug)]
pub struct SessionIdGetter {
    handle: RemoteHandle,
}

impl SessionIdGetter {
    pub async fn get(&self) -> RpcResult<Option<SessionId>> {
        self.handle.my_session_id().await
    }
}
