//! # Portlink Protocol Library
//!
//! This crate provides the per-channel RPC protocol for Portlink: two
//! processes that share nothing but an opaque, message-oriented duplex
//! channel expose named methods and properties to each other and call them
//! as if they were local.
//!
//! ## Overview
//!
//! - **Message Definitions**: the flat `{id, type, ...}` records exchanged over a channel
//! - **Addressing**: the handshake name grammar and composite addresses
//! - **Exposed Surface**: the methods and properties one side offers
//! - **Connection**: handshake, request correlation and inbound dispatch
//! - **Remote Handle**: the proxy used to reach the peer's surface
//! - **Transport**: the channel interfaces plus an in-process implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Remote Handle               │  call / get / set
//! ├─────────────────────────────────────────┤
//! │              Connection                 │  handshake, pending table
//! ├─────────────────────────────────────────┤
//! │               Messages                  │  flat JSON values
//! ├─────────────────────────────────────────┤
//! │         Transport (opaque channel)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Connection, ConnectionOptions, ExposedSurface};
//! use protocol::transport::memory::channel_pair;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), protocol::RpcError> {
//! let host_surface = ExposedSurface::builder()
//!     .method("add", |args| {
//!         let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!         Ok(json!(sum))
//!     })
//!     .build();
//!
//! let (host_end, client_end) = channel_pair("portlink-calc", None);
//! let _host = Connection::new(host_end, host_surface, ConnectionOptions::default());
//! let client = Connection::new(client_end, ExposedSurface::empty(), ConnectionOptions::default());
//!
//! let remote = client.remote_handle().await?;
//! assert_eq!(remote.call("add", vec![json!(2), json!(3)]).await?, Some(json!(5)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`address`]: Channel names, session and frame ids
//! - [`surface`]: Exposed methods and properties
//! - [`connection`]: Connection and Remote Handle
//! - [`transport`]: Channel interfaces and the memory transport
//! - [`error`]: Error types

pub mod address;
pub mod connection;
pub mod error;
pub mod messages;
pub mod surface;
pub mod transport;

pub use address::{Address, ChannelName, FrameId, NameScheme, SessionId, BASE_FRAME};
pub use connection::handle::{Member, PropertyKey, RemoteHandle, RemoteMethod, SessionIdGetter};
pub use connection::{Connection, ConnectionEvent, ConnectionOptions};
pub use error::{ProtocolError, Result, RpcError, RpcResult};
pub use messages::{BroadcastMessage, Message, MessageBody, RequestId, PING_TYPE};
pub use surface::{
    ExposedSurface, MethodOutcome, MethodResult, SurfaceBuilder, GET_MY_SESSION_ID, RESERVED_NAMES,
};
pub use transport::{Broadcaster, Channel, ChannelSink, Connector};
