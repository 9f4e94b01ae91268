//! Infrastructure layer for notify-bridge.
//!
//! The infrastructure layer handles all I/O: accepting WebSocket connections,
//! talking to PostgreSQL and reading the configuration file.
//!
//! # Responsibilities
//!
//! - Binding a TCP listener and performing the WebSocket upgrade ([`ws_server`])
//! - Mapping request paths to session variants ([`router`])
//! - Serialised writes to, and reads from, a client socket ([`socket`])
//! - Opening PostgreSQL connections and forwarding `NOTIFY` ([`postgres`])
//! - The optional TOML file ([`config_file`])
//! - An in-memory backend and client for tests ([`mock`])
//!
//! **Dependency rule**: this layer may depend on `application` and `domain`,
//! but MUST NOT be imported by either of them (test modules excepted).

pub mod config_file;
pub mod mock;
pub mod postgres;
pub mod router;
pub mod socket;
pub mod ws_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use postgres::{BackendQueries, PgConnector};
pub use router::BridgeRouter;
pub use socket::{SocketReader, SocketWriter};
pub use ws_server::BridgeServer;
