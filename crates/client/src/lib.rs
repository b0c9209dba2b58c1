//! # Portlink Client Library
//!
//! The connecting side of Portlink. A [`ClientWrapper`] owns one channel to
//! the host under a chosen logical name, exposes a surface of its own, and
//! comes back on its own when the host pings it after a restart.
//!
//! ```rust,no_run
//! use client::{ClientOptions, ClientWrapper};
//! use protocol::transport::memory::MemoryHub;
//! use protocol::{ExposedSurface, SessionId};
//!
//! # async fn demo() -> Result<(), client::ClientError> {
//! let hub = MemoryHub::new();
//! let surface = ExposedSurface::builder()
//!     .method("refresh", |_| Ok(serde_json::Value::Null))
//!     .build();
//!
//! let client = ClientWrapper::connect(
//!     "content",
//!     surface,
//!     hub.endpoint(Some(SessionId(3))),
//!     ClientOptions::default(),
//! )?;
//!
//! let host = client.remote_handle().await?;
//! host.call("register", vec![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod wrapper;

pub use error::{ClientError, Result};
pub use wrapper::{ClientContext, ClientEvent, ClientOptions, ClientWrapper};
