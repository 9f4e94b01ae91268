//! Domain layer for notify-bridge.
//!
//! The domain layer contains pure types that have no dependencies on sockets,
//! database drivers, or the async runtime.  Everything here can be built and
//! inspected in a plain `#[test]`.
//!
//! # What belongs in the domain layer?
//!
//! - Configuration structures ([`BridgeConfig`], [`PoolConfig`], [`DatabaseConfig`])
//! - The error taxonomy ([`BridgeError`]) and the names of backend calls
//! - Session descriptions ([`SessionFeatures`]) and identity generation
//! - Notification and inbound frame value types
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, `WebSocket` or `tokio_postgres` types
//! - File I/O or environment variable reading

pub mod config;
pub mod error;
pub mod notification;
pub mod session;

pub use config::{BridgeConfig, DatabaseConfig, PoolConfig};
pub use error::{BackendCall, BridgeError};
pub use notification::{InboundFrame, Notification, CALLBACK_CHANNEL};
pub use session::{uuid_ids, IdGenerator, SessionFeatures};
