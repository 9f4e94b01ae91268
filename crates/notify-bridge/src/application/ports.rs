//! Ports: the traits the application layer talks through.
//!
//! The engineering core (pool, listener, handshake, receive loop) never names
//! a concrete database driver or socket type.  It depends on four small
//! traits instead:
//!
//! - [`Connector`] opens new backend connections for the pool.
//! - [`BackendConnection`] is one open connection: subscribe, wait for a
//!   notification, and the four opaque backend calls.
//! - [`ClientSink`] writes text frames to one client.
//! - [`ClientSource`] reads frames from one client.
//!
//! The infrastructure layer provides the PostgreSQL and WebSocket
//! implementations, plus in-memory mocks for tests.

use async_trait::async_trait;

use crate::domain::{BridgeError, InboundFrame, Notification};

/// Opens fresh backend connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: BackendConnection;

    /// Opens one new connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BackendUnreachable`] if the backend cannot be
    /// reached or refuses the login.
    async fn connect(&self) -> Result<Self::Conn, BridgeError>;
}

/// One open backend connection.
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Subscribes this connection to `channel`.
    async fn listen(&mut self, channel: &str) -> Result<(), BridgeError>;

    /// Waits for the next notification on any channel this connection
    /// listens to.
    ///
    /// Must be cancel-safe: dropping the returned future before it completes
    /// must not lose a notification that has already been received.
    async fn next_notification(&mut self) -> Result<Notification, BridgeError>;

    /// Returns the state snapshot sent as a session's first frame.
    async fn fetch_snapshot(&mut self) -> Result<String, BridgeError>;

    /// Announces `session_id` to the backend.
    async fn register_session(&mut self, session_id: &str) -> Result<(), BridgeError>;

    /// Removes `session_id` from the backend.
    async fn deregister_session(&mut self, session_id: &str) -> Result<(), BridgeError>;

    /// Hands a client-submitted payload to the backend.
    async fn persist(&mut self, session_id: &str, payload: &str) -> Result<(), BridgeError>;

    /// Runs a multi-statement script (schema bootstrap at startup).
    async fn execute_script(&mut self, script: &str) -> Result<(), BridgeError>;

    /// Returns `true` once the underlying connection is known to be dead.
    fn is_closed(&self) -> bool;
}

/// Writes frames to one client.
///
/// Implementations shared between the listener task and the receive loop
/// must serialise writes so frames never interleave.
#[async_trait]
pub trait ClientSink: Send + Sync + 'static {
    /// Sends one text frame.
    ///
    /// May block for as long as the client does not read.  Callers race it
    /// against their cancellation scope and may drop it mid-write.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SocketClosed`] once the client is gone.
    async fn send_text(&self, text: String) -> Result<(), BridgeError>;

    /// Closes the socket.  Best effort; errors are swallowed.
    async fn close(&self);
}

/// Reads frames from one client.
#[async_trait]
pub trait ClientSource: Send {
    /// Waits for the next frame.  [`InboundFrame::Closed`] marks a clean end
    /// of the session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SocketReadFailed`] for anything other than a
    /// clean close.
    async fn recv(&mut self) -> Result<InboundFrame, BridgeError>;
}
