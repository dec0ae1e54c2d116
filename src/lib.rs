//! # whatsapp-gateway
//!
//! Multi-tenant WhatsApp gateway: hosts many independent client sessions
//! behind one HTTP API, pairs them to phones via rotating QR codes,
//! persists device credentials, and relays events to downstream
//! integrations.
//!
//! The wire protocol itself lives behind the [protocol::ProtocolClient]
//! capability; this crate owns the session lifecycle: registry, state
//! machine, pairing driver, event dispatch, and crash restore.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use whatsapp_gateway::{
//!     protocol::StubFactory,
//!     store::MemoryStore,
//!     SessionRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let factory = Arc::new(StubFactory::new(store.clone()));
//!     let registry = SessionRegistry::new(store, factory, Vec::new(), CancellationToken::new());
//!     registry.create("alice").await?;
//!     registry.connect("alice").await?;
//!     // Poll the QR endpoint and scan...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod session;
pub mod store;
pub mod subscriber;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SendReceipt, SessionHandle, SessionRegistry};
pub use types::{Event, Jid, SessionStatus};
