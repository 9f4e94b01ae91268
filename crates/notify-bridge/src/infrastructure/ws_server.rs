//! WebSocket server: accept loop and per-client task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections.
//! 3. Upgrading each connection to a WebSocket session, refusing paths the
//!    [`BridgeRouter`] does not know with HTTP 404.
//! 4. Handing the two socket halves to [`Bridge::serve`].
//! 5. Stopping cleanly when the shutdown token is cancelled: no new clients
//!    are accepted, every open session is cancelled, and `serve` returns
//!    only after all session tasks have finished.
//!
//! Each client runs in its own Tokio task, tracked in a `JoinSet` so the
//! server can wait for them on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::ports::Connector;
use crate::application::{Bridge, SessionOutcome};
use crate::infrastructure::router::BridgeRouter;
use crate::infrastructure::socket::{SocketReader, SocketWriter};

// ── Public API ────────────────────────────────────────────────────────────────

/// A bound WebSocket listener serving bridge sessions.
pub struct BridgeServer<C: Connector> {
    listener: TcpListener,
    router: Arc<BridgeRouter>,
    bridge: Arc<Bridge<C>>,
}

impl<C: Connector> BridgeServer<C> {
    /// Binds the listener.  Use port 0 to let the OS pick one.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (port in use, missing
    /// permission).
    pub async fn bind(
        addr: SocketAddr,
        router: BridgeRouter,
        bridge: Bridge<C>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
        Ok(Self {
            listener,
            router: Arc::new(router),
            bridge: Arc::new(bridge),
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read the listener's local address")
    }

    /// Runs the accept loop until `shutdown` is cancelled.
    ///
    /// On shutdown the bridge's background scope is cancelled too, which ends
    /// every open session; the call returns once all of them have been torn
    /// down and their leases are back in the pool.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let local = self.local_addr()?;
        let paths: Vec<&str> = self.router.paths().collect();
        info!("WebSocket bridge listening on {local} (endpoints: {})", paths.join(", "));

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; stopping accept loop");
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("client task panicked: {e}");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("new connection from {peer_addr}");
                        let router = Arc::clone(&self.router);
                        let bridge = Arc::clone(&self.bridge);
                        sessions.spawn(handle_client(stream, peer_addr, router, bridge));
                    }
                    // Transient (e.g. too many open file descriptors); keep serving.
                    Err(e) => error!("accept error: {e}"),
                },
            }
        }

        drop(self.listener);
        self.bridge.background().cancel();
        let open = sessions.len();
        if open > 0 {
            info!("waiting for {open} session(s) to finish");
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("client task panicked: {e}");
            }
        }
        info!("WebSocket bridge stopped");
        Ok(())
    }
}

// ── Per-client handler ────────────────────────────────────────────────────────

async fn handle_client<C: Connector>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<BridgeRouter>,
    bridge: Arc<Bridge<C>>,
) {
    let mut features = None;
    let upgraded = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match router.resolve(req.uri().path()) {
            Some(found) => {
                features = Some(found);
                Ok(resp)
            }
            None => {
                let reason = format!("no endpoint at {}", req.uri().path());
                let mut refusal = ErrorResponse::new(Some(reason));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    })
    .await;

    let ws_stream = match upgraded {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("WebSocket handshake with {peer_addr} failed: {e}");
            return;
        }
    };
    let Some(features) = features else {
        return;
    };

    let (tx, rx) = ws_stream.split();
    let sink = Arc::new(SocketWriter::new(tx));
    let report = bridge.serve(features, SocketReader::new(rx), sink).await;

    match &report.outcome {
        SessionOutcome::HandshakeFailed(e) if e.is_cancellation() => {
            debug!("session {} ({peer_addr}) cancelled during handshake", report.id);
        }
        SessionOutcome::HandshakeFailed(_) | SessionOutcome::ReadFailed(_) => {
            warn!(
                "session {} ({peer_addr}) ended: {}",
                report.id, report.outcome
            );
        }
        SessionOutcome::ClientClosed | SessionOutcome::Shutdown => {
            info!(
                "session {} ({peer_addr}) ended: {}; {} notification(s) forwarded, \
                 {} frame(s) relayed",
                report.id,
                report.outcome,
                report.notifications_forwarded,
                report.inbound.relayed
            );
        }
    }
}
