//! # Portlink Host Library
//!
//! This crate provides the accepting side of Portlink: the process that
//! receives many inbound channels and keeps track of who is on the other
//! end of each one.
//!
//! ## Overview
//!
//! - **Connection Registry**: files connections under logical name, session and frame
//! - **Persistence**: remembers session-bound connections across restarts
//! - **Restoration**: pings remembered clients so they reconnect
//! - **Configuration**: TOML configuration with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Connection Registry                    │
//! │                                                         │
//! │   content-3 ─┬─ base ──────── Connection                │
//! │              └─ ad-slot ───── Connection                │
//! │   popup ────── base ──────── Connection                 │
//! ├─────────────────────────┬───────────────────────────────┤
//! │   Key-value store       │   Broadcaster (pings)         │
//! └─────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use host::{Config, ConnectionRegistry, JsonFileStore, RegistryOptions};
//! use protocol::transport::memory::MemoryHub;
//! use protocol::ExposedSurface;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let hub = MemoryHub::new();
//!
//!     let registry = ConnectionRegistry::new(
//!         ExposedSurface::empty(),
//!         RegistryOptions::from_config(&config)?,
//!         JsonFileStore::new(config.store_path()),
//!         hub.clone(),
//!     );
//!     registry.start(hub.listen());
//!
//!     if let Some(content) = registry.get_connection("content", None, None).await {
//!         content.call("refresh", vec![]).await?;
//!     }
//!
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Connection registry
//! - [`store`]: Key-value persistence

pub mod config;
pub mod registry;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export registry types for convenience
pub use registry::{
    ConnectionRegistry, ErrorCallback, RegistryError, RegistryEvent, RegistryOptions,
};

// Re-export store types for convenience
pub use store::{
    load_address_set, save_address_set, JsonFileStore, KeyValueStore, MemoryStore,
    PersistedAddress,
};
