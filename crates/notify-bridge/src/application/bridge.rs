//! Bridge orchestrator: one call per client connection.
//!
//! [`Bridge::serve`] composes the pieces in order:
//!
//! ```text
//! generate id ─► perform_handshake ─► run_receive_loop ─► await listener ─► close socket
//!                       │ error
//!                       └──────────────────────────────────────────────► close socket
//! ```
//!
//! When `serve` returns, both leases of the session are back in the pool and
//! the listener task has terminated, whichever path the session took.  That
//! holds for a client that stopped reading too: its pending writes are
//! dropped when the session scope is cancelled, and the closing handshake is
//! given up after [`CLOSE_TIMEOUT`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::handshake::{perform_handshake, HandshakeContext};
use crate::application::listener::{ListenerEnd, ListenerExit};
use crate::application::pool::LeasePool;
use crate::application::ports::{ClientSink, ClientSource, Connector};
use crate::application::receive_loop::{run_receive_loop, CancelOnDrop, LoopEnd, LoopStats};
use crate::domain::{uuid_ids, BridgeError, IdGenerator, SessionFeatures};

/// How long `serve` waits for the client socket to close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session ended, as seen from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The handshake failed; the client never saw the session as connected.
    HandshakeFailed(BridgeError),
    /// The client closed the connection.
    ClientClosed,
    /// Reading from the client failed.
    ReadFailed(BridgeError),
    /// The bridge shut down while the session was open.
    Shutdown,
}

impl From<LoopEnd> for SessionOutcome {
    fn from(end: LoopEnd) -> Self {
        match end {
            LoopEnd::ClientClosed => SessionOutcome::ClientClosed,
            LoopEnd::ReadFailed(e) => SessionOutcome::ReadFailed(e),
            LoopEnd::Shutdown => SessionOutcome::Shutdown,
        }
    }
}

/// Everything known about a session once it is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: String,
    pub outcome: SessionOutcome,
    /// Receive-loop counters; all zero when the handshake failed.
    pub inbound: LoopStats,
    /// Why the listener stopped; `None` when the handshake failed.
    pub listener_end: Option<ListenerEnd>,
    /// Notifications written to the client by the listener.
    pub notifications_forwarded: u64,
}

/// Runs client sessions against one pool.
pub struct Bridge<C: Connector> {
    pool: LeasePool<C>,
    background: CancellationToken,
    ids: IdGenerator,
    readiness_timeout: Duration,
}

impl<C: Connector> Bridge<C> {
    /// Creates a bridge whose sessions are children of `background`.
    ///
    /// Cancelling `background` ends every open session.
    pub fn new(pool: LeasePool<C>, background: CancellationToken) -> Self {
        Self {
            pool,
            background,
            ids: uuid_ids(),
            readiness_timeout: Duration::from_secs(5),
        }
    }

    /// Replaces the session id generator.
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Sets how long a handshake waits for its listener to subscribe.
    pub fn with_readiness_timeout(mut self, limit: Duration) -> Self {
        self.readiness_timeout = limit;
        self
    }

    pub fn pool(&self) -> &LeasePool<C> {
        &self.pool
    }

    pub fn background(&self) -> &CancellationToken {
        &self.background
    }

    /// Runs one client session to completion.
    ///
    /// `source` and `sink` are the two halves of the client socket.  The sink
    /// is shared with the listener task, so it must serialise writes.
    pub async fn serve<R, S>(
        &self,
        features: SessionFeatures,
        mut source: R,
        sink: Arc<S>,
    ) -> SessionReport
    where
        R: ClientSource,
        S: ClientSink + ?Sized,
    {
        let id = (self.ids)();
        let ctx = HandshakeContext {
            pool: &self.pool,
            background: &self.background,
            readiness_timeout: self.readiness_timeout,
        };

        let session = match perform_handshake(&ctx, &id, features, &sink).await {
            Ok(session) => session,
            Err(e) => {
                if !e.is_cancellation() {
                    warn!("{id}: handshake failed: {e}");
                }
                close_socket(&id, sink.as_ref()).await;
                return SessionReport {
                    id,
                    outcome: SessionOutcome::HandshakeFailed(e),
                    inbound: LoopStats::default(),
                    listener_end: None,
                    notifications_forwarded: 0,
                };
            }
        };

        // Only when reaching here is the connection truly established.
        info!("{id} connected...");
        let _guard = CancelOnDrop(session.scope.clone());

        let outcome = run_receive_loop(session, &mut source).await;
        let listener = match outcome.listener.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!("{id}: listener task panicked: {e}");
                None
            }
        };
        close_socket(&id, sink.as_ref()).await;

        SessionReport {
            id,
            outcome: outcome.end.into(),
            inbound: outcome.stats,
            notifications_forwarded: listener.as_ref().map_or(0, |l| l.forwarded),
            listener_end: listener.map(|ListenerExit { end, .. }| end),
        }
    }
}

async fn close_socket<S: ClientSink + ?Sized>(id: &str, sink: &S) {
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("{id}: client did not take the close frame within {CLOSE_TIMEOUT:?}");
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::HandshakeFailed(e) => write!(f, "handshake failed: {e}"),
            SessionOutcome::ClientClosed => f.write_str("client closed"),
            SessionOutcome::ReadFailed(e) => write!(f, "read failed: {e}"),
            SessionOutcome::Shutdown => f.write_str("shutdown"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::PoolConfig;
    use crate::infrastructure::mock::{BackendEvent, MockBackend, RecordingSink, ScriptedSource};

    fn bridge(backend: &MockBackend, max_leases: usize) -> Bridge<MockBackend> {
        let pool = LeasePool::new(
            backend.clone(),
            PoolConfig {
                max_leases,
                acquire_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        );
        let counter = Arc::new(AtomicUsize::new(0));
        Bridge::new(pool, CancellationToken::new()).with_id_generator(Arc::new(move || {
            format!("user-{}", counter.fetch_add(1, Ordering::Relaxed))
        }))
    }

    #[tokio::test]
    async fn test_full_session_round_trip() {
        // Arrange
        let backend = MockBackend::new();
        backend.set_snapshot("snapshot");
        let bridge = Arc::new(bridge(&backend, 2));
        let sink = Arc::new(RecordingSink::new());
        let (source, feeder) = ScriptedSource::new();

        // Act: run the session in the background and publish once it is registered
        let task = {
            let bridge = Arc::clone(&bridge);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                bridge.serve(SessionFeatures::messages(), source, sink).await
            })
        };
        backend
            .wait_for_event(&BackendEvent::Registered("user-0".into()), Duration::from_secs(1))
            .await;
        backend.publish("event-1");
        sink.wait_for_frames(2, Duration::from_secs(1)).await;
        feeder.close();
        let report = task.await.unwrap();

        // Assert
        assert_eq!(report.id, "user-0");
        assert_eq!(report.outcome, SessionOutcome::ClientClosed);
        assert_eq!(report.notifications_forwarded, 1);
        assert_eq!(report.listener_end, Some(ListenerEnd::Cancelled));
        assert_eq!(sink.frames(), vec!["snapshot".to_string(), "event-1".to_string()]);
        assert!(sink.is_closed());
        let stats = bridge.pool().stats();
        assert_eq!((stats.acquired, stats.released, stats.outstanding), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_handshake_failure_closes_socket() {
        let backend = MockBackend::new();
        backend.fail_listen(true);
        let bridge = bridge(&backend, 2);
        let sink = Arc::new(RecordingSink::new());
        let (source, _feeder) = ScriptedSource::new();

        let report = bridge.serve(SessionFeatures::messages(), source, Arc::clone(&sink)).await;

        assert!(matches!(
            report.outcome,
            SessionOutcome::HandshakeFailed(BridgeError::SubscribeFailed { .. })
        ));
        assert!(sink.frames().is_empty());
        assert!(sink.is_closed());
        assert_eq!(bridge.pool().stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_listener_failure_keeps_session_alive() {
        // Arrange
        let backend = MockBackend::new();
        let bridge = Arc::new(bridge(&backend, 2));
        let sink = Arc::new(RecordingSink::new());
        let (source, feeder) = ScriptedSource::new();
        let task = {
            let bridge = Arc::clone(&bridge);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                bridge.serve(SessionFeatures::messages(), source, sink).await
            })
        };
        backend
            .wait_for_event(&BackendEvent::Registered("user-0".into()), Duration::from_secs(1))
            .await;

        // Act: break the notification stream, then keep talking to the session
        backend.break_listeners("terminating connection due to administrator command");
        tokio::time::sleep(Duration::from_millis(20)).await;
        feeder.text("still here");
        backend
            .wait_for_event(
                &BackendEvent::Persisted {
                    session_id: "user-0".into(),
                    payload: "still here".into(),
                },
                Duration::from_secs(1),
            )
            .await;
        feeder.close();
        let report = task.await.unwrap();

        // Assert
        assert_eq!(report.outcome, SessionOutcome::ClientClosed);
        assert!(matches!(report.listener_end, Some(ListenerEnd::WaitFailed(_))));
        assert_eq!(report.inbound.relayed, 1);
    }

    #[tokio::test]
    async fn test_background_cancel_ends_open_session() {
        let backend = MockBackend::new();
        let bridge = Arc::new(bridge(&backend, 2));
        let (source, _feeder) = ScriptedSource::new();
        let task = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .serve(SessionFeatures::notify_only(), source, Arc::new(RecordingSink::new()))
                    .await
            })
        };
        backend.wait_for_event(&BackendEvent::Listened, Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        bridge.background().cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("session ends after shutdown")
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Shutdown);
        assert_eq!(bridge.pool().stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_does_not_pin_session() {
        // Arrange: a notify-only session whose client never drains its socket
        let backend = MockBackend::new();
        let bridge = Arc::new(bridge(&backend, 2));
        let sink = Arc::new(RecordingSink::new());
        sink.stall();
        let (source, feeder) = ScriptedSource::new();
        let task = {
            let bridge = Arc::clone(&bridge);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                bridge.serve(SessionFeatures::notify_only(), source, sink).await
            })
        };
        backend.wait_for_event(&BackendEvent::Listened, Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Act: a notification gets stuck in the write, then the client goes away
        backend.publish("stuck");
        backend.wait_until_delivered(1, Duration::from_secs(1)).await;
        feeder.close();
        let report = tokio::time::timeout(Duration::from_secs(2) + CLOSE_TIMEOUT, task)
            .await
            .expect("session must end")
            .unwrap();

        // Assert
        assert_eq!(report.outcome, SessionOutcome::ClientClosed);
        assert_eq!(report.listener_end, Some(ListenerEnd::Cancelled));
        assert_eq!(report.notifications_forwarded, 0);
        assert_eq!(bridge.pool().stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_snapshot_precedes_notification_raised_during_handshake() {
        let backend = MockBackend::new();
        backend.set_snapshot("SNAPSHOT");
        backend.publish_while_fetching_snapshot("concurrent-event");
        let bridge = Arc::new(bridge(&backend, 2));
        let sink = Arc::new(RecordingSink::new());
        let (source, feeder) = ScriptedSource::new();
        let task = {
            let bridge = Arc::clone(&bridge);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                bridge.serve(SessionFeatures::messages(), source, sink).await
            })
        };

        sink.wait_for_frames(2, Duration::from_secs(1)).await;
        feeder.close();
        task.await.unwrap();

        assert_eq!(sink.frames()[0], "SNAPSHOT");
        assert_eq!(sink.frames()[1], "concurrent-event");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(SessionOutcome::ClientClosed.to_string(), "client closed");
        assert!(SessionOutcome::HandshakeFailed(BridgeError::SocketClosed)
            .to_string()
            .starts_with("handshake failed"));
    }
}
