//! Application layer for notify-bridge.
//!
//! This is where sessions are built and torn down.  The layer knows *what*
//! has to happen and in which order, and reaches the outside world only
//! through the traits in [`ports`].
//!
//! # Responsibilities
//!
//! - [`pool`]: bounded leasing of backend connections
//! - [`listener`]: the per-session notification listener task
//! - [`handshake`]: the ordered steps that establish a session
//! - [`receive_loop`]: inbound relay and session teardown
//! - [`bridge`]: the orchestrator that runs one session per client
//!
//! # What does NOT belong here?
//!
//! - Opening sockets, accepting connections or speaking SQL (infrastructure)
//! - Reading configuration (done in `main.rs`)

pub mod bridge;
pub mod handshake;
pub mod listener;
pub mod pool;
pub mod ports;
pub mod receive_loop;

pub use bridge::{Bridge, SessionOutcome, SessionReport};
pub use pool::{Lease, LeasePool, PoolStats};
pub use ports::{BackendConnection, ClientSink, ClientSource, Connector};
