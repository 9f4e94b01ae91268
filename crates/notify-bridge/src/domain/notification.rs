//! Notification and inbound frame value types.

/// The single pub/sub channel the bridge subscribes to.
pub const CALLBACK_CHANNEL: &str = "callback";

/// One notification delivered by the backend.
///
/// The payload is passed to the client verbatim; the bridge never parses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// One unit read from a client socket, reduced to what the receive loop
/// cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame; its content is relayed to the backend untouched.
    Text(String),
    /// A binary frame of the given length.  The bridge speaks text only.
    Binary(usize),
    /// A ping, pong or raw control frame.
    Control,
    /// The client ended the session (close frame or end of stream).
    Closed,
}
