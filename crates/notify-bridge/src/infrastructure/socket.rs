//! WebSocket halves adapted to the application's client ports.
//!
//! After the upgrade, a `WebSocketStream` is split into a write sink and a
//! read stream.  The write half is written to by two tasks (the listener and,
//! for the snapshot, the handshake), so [`SocketWriter`] keeps it behind a
//! `tokio::sync::Mutex`: one frame is fully written before the next one
//! starts.  The read half is owned by the receive loop alone.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::application::ports::{ClientSink, ClientSource};
use crate::domain::{BridgeError, InboundFrame};

/// Serialised write access to one client socket.
pub struct SocketWriter<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    closed: AtomicBool,
}

impl<S> SocketWriter<S> {
    pub fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> ClientSink for SocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::SocketClosed);
        }
        let mut sink = self.sink.lock().await;
        match sink.send(WsMessage::Text(text)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("WebSocket send failed: {e}");
                self.closed.store(true, Ordering::Release);
                Err(BridgeError::SocketClosed)
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("WebSocket close failed: {e}");
        }
    }
}

/// The read half of one client socket.
pub struct SocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> SocketReader<S> {
    pub fn new(stream: SplitStream<WebSocketStream<S>>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> ClientSource for SocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<InboundFrame, BridgeError> {
        match self.stream.next().await {
            None => Ok(InboundFrame::Closed),
            Some(Ok(msg)) => Ok(classify_message(msg)),
            Some(Err(e)) => classify_error(e),
        }
    }
}

fn classify_message(msg: WsMessage) -> InboundFrame {
    match msg {
        WsMessage::Text(text) => InboundFrame::Text(text),
        WsMessage::Binary(data) => InboundFrame::Binary(data.len()),
        // tungstenite answers pings itself.
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => InboundFrame::Control,
        WsMessage::Close(_) => InboundFrame::Closed,
    }
}

/// A peer that drops the TCP connection without a close frame has still
/// ended the session; anything else is a real read failure.
fn classify_error(err: WsError) -> Result<InboundFrame, BridgeError> {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Ok(InboundFrame::Closed)
        }
        other => Err(BridgeError::SocketReadFailed(other.to_string())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
