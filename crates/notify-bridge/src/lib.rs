//! notify-bridge library crate.
//!
//! Bridges a PostgreSQL `LISTEN`/`NOTIFY` channel to live WebSocket sessions.
//! Every client that connects gets its own subscription to the `callback`
//! channel and receives each notification payload verbatim as a text frame.
//! The full variant also sends a state snapshot first, registers the session
//! with the database and relays the client's own frames back to it.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (text frames over WebSocket)
//!         ↕
//! [notify-bridge]
//!   ├── domain/           Pure types: config, errors, notifications, session features
//!   ├── application/      Lease pool, listener, handshake, receive loop, orchestrator
//!   └── infrastructure/
//!         ├── ws_server/  Accept loop and WebSocket upgrade (tokio-tungstenite)
//!         ├── router/     Path → session variant
//!         ├── socket/     Serialised socket writer, socket reader
//!         ├── postgres/   Backend connections (tokio-postgres)
//!         └── mock/       In-memory backend and client for tests
//!         ↕
//! PostgreSQL (LISTEN callback, stored functions)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and reaches the outside world only
//!   through the traits in `application::ports`.
//! - `infrastructure` implements those traits with real sockets and drivers.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: session lifecycle and connection leasing.
pub mod application;

/// Infrastructure layer: WebSocket server, PostgreSQL adapter, test doubles.
pub mod infrastructure;
