//! Session receive loop.
//!
//! Reads client frames for the lifetime of an established session.  Text
//! frames are relayed to the backend when the session has inbound relay
//! enabled; a failing relay call is logged and the loop carries on.
//!
//! The loop ends on a clean close, a read error, or when the process-wide
//! scope above the session scope is cancelled (shutdown), even in the middle
//! of a relay call.  On the way out it deregisters the session (best effort,
//! bounded by [`DEREGISTER_TIMEOUT`]), cancels the session scope, and returns
//! the base lease.  A lease left with a call in flight is discarded.  Waiting
//! for the listener is left to the caller.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::handshake::EstablishedSession;
use crate::application::listener::ListenerExit;
use crate::application::ports::{BackendConnection, ClientSource, Connector};
use crate::domain::{BridgeError, InboundFrame};

/// Upper bound on the deregistration call during teardown.
pub const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// How a session that completed its handshake came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEnd {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// Reading from the client failed.
    ReadFailed(BridgeError),
    /// The bridge is shutting down.
    Shutdown,
}

/// Counters collected by the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    /// Text frames read from the client.
    pub received: u64,
    /// Text frames the backend accepted.
    pub relayed: u64,
    /// Text frames the backend rejected.
    pub relay_failures: u64,
}

/// The receive loop's result, plus the listener task it leaves behind.
pub struct LoopOutcome {
    pub end: LoopEnd,
    pub stats: LoopStats,
    /// Still running until the cancellation it was just sent takes effect.
    pub listener: tokio::task::JoinHandle<ListenerExit>,
}

/// Runs the receive loop for `session` until the client goes away.
pub async fn run_receive_loop<C, R>(session: EstablishedSession<C>, source: &mut R) -> LoopOutcome
where
    C: Connector,
    R: ClientSource + ?Sized,
{
    let EstablishedSession {
        id,
        features,
        mut base,
        scope,
        listener,
    } = session;

    let mut stats = LoopStats::default();
    let mut interrupted = false;

    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => break LoopEnd::Shutdown,
            frame = source.recv() => frame,
        };

        match frame {
            Ok(InboundFrame::Text(payload)) => {
                stats.received += 1;
                if !features.inbound_relay {
                    debug!("{id}: ignoring inbound frame ({} bytes)", payload.len());
                    continue;
                }
                let relayed = tokio::select! {
                    biased;
                    _ = scope.cancelled() => {
                        interrupted = true;
                        break LoopEnd::Shutdown;
                    }
                    res = base.persist(&id, &payload) => res,
                };
                match relayed {
                    Ok(()) => stats.relayed += 1,
                    Err(e) => {
                        stats.relay_failures += 1;
                        warn!("could not receive data from user {id}: {e}");
                    }
                }
            }
            Ok(InboundFrame::Binary(len)) => {
                warn!("{id}: unexpected binary frame ({len} bytes, ignored)");
            }
            Ok(InboundFrame::Control) => {}
            Ok(InboundFrame::Closed) => {
                info!("{id} disconnected...");
                break LoopEnd::ClientClosed;
            }
            Err(e) => {
                warn!("{id}: could not receive message via WebSocket: {e}");
                break LoopEnd::ReadFailed(e);
            }
        }
    };

    if features.registration {
        match tokio::time::timeout(DEREGISTER_TIMEOUT, base.deregister_session(&id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("could not remove user {id}: {e}"),
            Err(_) => {
                interrupted = true;
                warn!("could not remove user {id}: no answer within {DEREGISTER_TIMEOUT:?}");
            }
        }
    }

    scope.cancel();
    if interrupted {
        base.discard();
    } else {
        base.release();
    }

    LoopOutcome {
        end,
        stats,
        listener,
    }
}

/// Cancels `scope` when dropped.
///
/// Held by the orchestrator for the whole session so the listener is told to
/// stop even if the session task itself is aborted mid-await.
pub struct CancelOnDrop(pub CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::application::handshake::{perform_handshake, HandshakeContext};
    use crate::application::listener::ListenerEnd;
    use crate::application::pool::LeasePool;
    use crate::domain::{BackendCall, PoolConfig, SessionFeatures};
    use crate::infrastructure::mock::{BackendEvent, MockBackend, RecordingSink, ScriptedSource};

    async fn establish(
        pool: &LeasePool<MockBackend>,
        background: &CancellationToken,
        features: SessionFeatures,
    ) -> EstablishedSession<MockBackend> {
        let ctx = HandshakeContext {
            pool,
            background,
            readiness_timeout: Duration::from_secs(1),
        };
        perform_handshake(&ctx, "s-1", features, &Arc::new(RecordingSink::new()))
            .await
            .expect("handshake")
    }

    #[tokio::test]
    async fn test_relay_failure_does_not_end_session() {
        // Arrange
        let backend = MockBackend::new();
        backend.fail_persist_containing("malformed");
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();

        // Act
        feeder.text("{malformed");
        feeder.text(r#"{"body":"hello"}"#);
        feeder.close();
        let outcome = run_receive_loop(session, &mut source).await;

        // Assert
        assert_eq!(outcome.end, LoopEnd::ClientClosed);
        assert_eq!(outcome.stats.received, 2);
        assert_eq!(outcome.stats.relay_failures, 1);
        assert_eq!(outcome.stats.relayed, 1);
        assert!(backend.events().contains(&BackendEvent::Persisted {
            session_id: "s-1".into(),
            payload: r#"{"body":"hello"}"#.into(),
        }));
        outcome.listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_deregisters_and_cancels_listener() {
        // Arrange
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();

        // Act
        feeder.close();
        let outcome = run_receive_loop(session, &mut source).await;
        let exit = tokio::time::timeout(Duration::from_secs(1), outcome.listener)
            .await
            .expect("listener stops promptly")
            .unwrap();

        // Assert
        assert_eq!(outcome.end, LoopEnd::ClientClosed);
        assert!(backend
            .events()
            .contains(&BackendEvent::Deregistered("s-1".into())));
        assert_eq!(exit.end, ListenerEnd::Cancelled);
        let stats = pool.stats();
        assert_eq!((stats.acquired, stats.released, stats.outstanding), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_read_error_still_deregisters() {
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();

        feeder.fail("connection reset by peer");
        let outcome = run_receive_loop(session, &mut source).await;

        assert!(matches!(outcome.end, LoopEnd::ReadFailed(BridgeError::SocketReadFailed(_))));
        assert!(backend
            .events()
            .contains(&BackendEvent::Deregistered("s-1".into())));
        outcome.listener.await.unwrap();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_deregister_failure_is_absorbed() {
        let backend = MockBackend::new();
        backend.fail_call(BackendCall::DeregisterSession, true);
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();

        feeder.close();
        let outcome = run_receive_loop(session, &mut source).await;

        assert_eq!(outcome.end, LoopEnd::ClientClosed);
        outcome.listener.await.unwrap();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_notify_only_session_drops_inbound_text() {
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::notify_only()).await;
        let (mut source, feeder) = ScriptedSource::new();

        feeder.text("ignored");
        feeder.close();
        let outcome = run_receive_loop(session, &mut source).await;

        assert_eq!(outcome.stats.received, 1);
        assert_eq!(outcome.stats.relayed, 0);
        let events = backend.events();
        assert!(!events.iter().any(|e| matches!(e, BackendEvent::Persisted { .. })));
        assert!(!events.iter().any(|e| matches!(e, BackendEvent::Deregistered(_))));
        outcome.listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_shutdown_ends_loop() {
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, _feeder) = ScriptedSource::new();

        background.cancel();
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            run_receive_loop(session, &mut source),
        )
        .await
        .expect("loop must notice shutdown");

        assert_eq!(outcome.end, LoopEnd::Shutdown);
        outcome.listener.await.unwrap();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_cancel_on_drop_cancels_token() {
        let token = CancellationToken::new();
        {
            let _guard = CancelOnDrop(token.clone());
        }
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_hung_relay_call() {
        // Arrange
        let backend = MockBackend::new();
        backend.hang_call(BackendCall::Persist, true);
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();
        feeder.text(r#"{"body":"never answered"}"#);
        let running = tokio::spawn(async move { run_receive_loop(session, &mut source).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Act
        background.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("a hung relay call must not block shutdown")
            .unwrap();

        // Assert
        assert_eq!(outcome.end, LoopEnd::Shutdown);
        assert_eq!(outcome.stats.relayed, 0);
        assert!(backend
            .events()
            .contains(&BackendEvent::Deregistered("s-1".into())));
        outcome.listener.await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.outstanding, stats.idle), (0, 0));
    }

    #[tokio::test]
    async fn test_hung_deregistration_is_bounded() {
        let backend = MockBackend::new();
        backend.hang_call(BackendCall::DeregisterSession, true);
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let background = CancellationToken::new();
        let session = establish(&pool, &background, SessionFeatures::messages()).await;
        let (mut source, feeder) = ScriptedSource::new();

        feeder.close();
        let outcome = tokio::time::timeout(
            DEREGISTER_TIMEOUT + Duration::from_secs(2),
            run_receive_loop(session, &mut source),
        )
        .await
        .expect("teardown must not wait forever on the backend");

        assert_eq!(outcome.end, LoopEnd::ClientClosed);
        outcome.listener.await.unwrap();
        assert_eq!(pool.stats().outstanding, 0);
    }
}
