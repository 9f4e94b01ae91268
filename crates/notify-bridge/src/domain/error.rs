//! Error taxonomy for the bridge.
//!
//! Every fallible step of a session maps onto one [`BridgeError`] variant.
//! Errors raised during the handshake abort the session before the client is
//! considered connected; errors raised afterwards are logged and absorbed by
//! the session that hit them.  None of them is fatal to the process.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The opaque backend operations a session depends on.
///
/// The bridge never looks inside these calls; it only needs a name for log
/// lines and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    /// Subscribe a connection to the notification channel.
    Listen,
    /// Fetch the state snapshot sent as a session's first frame.
    FetchSnapshot,
    /// Announce a session identifier to the backend.
    RegisterSession,
    /// Remove a session identifier from the backend.
    DeregisterSession,
    /// Hand a client-submitted payload to the backend.
    Persist,
    /// Run a bootstrap script.
    ExecuteScript,
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendCall::Listen => "listen",
            BackendCall::FetchSnapshot => "fetch_snapshot",
            BackendCall::RegisterSession => "register_session",
            BackendCall::DeregisterSession => "deregister_session",
            BackendCall::Persist => "persist",
            BackendCall::ExecuteScript => "execute_script",
        };
        f.write_str(name)
    }
}

/// Errors produced by the pool, the listener, the handshake and the receive loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Every lease is checked out and none was returned within the acquire timeout.
    #[error("connection pool exhausted: {max_leases} lease(s) in use after waiting {waited:?}")]
    PoolExhausted { max_leases: usize, waited: Duration },

    /// A new backend connection could not be opened, or an open one broke.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The listener could not subscribe to its channel, or exited before
    /// confirming the subscription.
    #[error("could not subscribe to channel '{channel}': {reason}")]
    SubscribeFailed { channel: String, reason: String },

    /// The listener did not confirm its subscription in time.
    #[error("listener did not confirm its subscription within {0:?}")]
    ReadinessTimeout(Duration),

    /// Waiting for the next notification failed for a reason other than
    /// cancellation.
    #[error("waiting for a notification failed: {0}")]
    NotificationWaitFailed(String),

    /// Reading the next frame from the client socket failed.
    #[error("could not read from client socket: {0}")]
    SocketReadFailed(String),

    /// The client socket is closed; nothing more can be written to it.
    #[error("client socket closed")]
    SocketClosed,

    /// One of the backend calls returned an error.
    #[error("backend call {call} failed: {reason}")]
    BackendCallFailed { call: BackendCall, reason: String },

    /// The operation was interrupted by its cancellation scope.
    ///
    /// Cancellation is a normal way for a wait to end and is never logged as
    /// an error.
    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Shorthand for [`BridgeError::BackendCallFailed`].
    pub fn call_failed(call: BackendCall, reason: impl fmt::Display) -> Self {
        BridgeError::BackendCallFailed {
            call,
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for [`BridgeError::Cancelled`].
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
