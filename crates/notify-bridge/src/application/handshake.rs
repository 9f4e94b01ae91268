//! Session handshake: the ordered, fail-fast steps that turn a fresh client
//! connection into an established session.
//!
//! ```text
//! 1. acquire base lease            (background scope)
//! 2. create session scope          (child of the background scope)
//! 3. acquire callback lease        (session scope)
//! 4. spawn listener on callback lease
//! 5. wait for the readiness signal
//! 6. [snapshot]      fetch snapshot, send it as the first frame
//!    open the listener's start gate
//! 7. [registration]  register the session id
//! ```
//!
//! Subscribing (step 5) strictly precedes the snapshot and the registration,
//! so a backend event fired after either of them is always caught by the
//! listener.  The listener holds such events back until the snapshot is out,
//! so the snapshot is always the first frame.  Registration comes after the
//! first frame, so the backend never addresses a client that cannot observe
//! traffic yet.
//!
//! Every backend call and the snapshot write are raced against the session
//! scope, so shutdown is never stuck behind a hung database or a client that
//! stopped reading.
//!
//! Any failure undoes everything acquired so far before returning: the scope
//! is cancelled, the base lease is returned, and the listener task is awaited
//! so its lease is back in the pool when the error reaches the caller.  A base
//! lease interrupted mid-call is discarded rather than recycled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::listener::{spawn_listener, ListenerExit, ReadySignal};
use crate::application::pool::{Lease, LeasePool};
use crate::application::ports::{BackendConnection, ClientSink, Connector};
use crate::domain::{BridgeError, SessionFeatures, CALLBACK_CHANNEL};

/// Shared inputs every handshake needs.
pub struct HandshakeContext<'a, C: Connector> {
    pub pool: &'a LeasePool<C>,
    /// Process-wide scope; each session scope is a child of it.
    pub background: &'a CancellationToken,
    pub readiness_timeout: Duration,
}

/// A session that completed its handshake and is ready for the receive loop.
pub struct EstablishedSession<C: Connector> {
    pub id: String,
    pub features: SessionFeatures,
    /// Lease used for snapshot, registration and inbound relay calls.
    pub base: Lease<C>,
    /// Cancelling this stops the listener.
    pub scope: CancellationToken,
    /// The listener task; owns the callback lease.
    pub listener: JoinHandle<ListenerExit>,
}

/// Runs the handshake for session `id`.
///
/// # Errors
///
/// Returns the first failing step's error.  By then every resource acquired
/// by the handshake has been returned and nothing was sent to the client.
pub async fn perform_handshake<C, S>(
    ctx: &HandshakeContext<'_, C>,
    id: &str,
    features: SessionFeatures,
    sink: &Arc<S>,
) -> Result<EstablishedSession<C>, BridgeError>
where
    C: Connector,
    S: ClientSink + ?Sized,
{
    // ── Steps 1-3: leases and scope ───────────────────────────────────────────
    let base = ctx.pool.acquire(ctx.background).await.map_err(|e| {
        warn!("{id}: could not acquire database base connection: {e}");
        e
    })?;

    let scope = ctx.background.child_token();

    let callback = match ctx.pool.acquire(&scope).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!("{id}: could not acquire database callback connection: {e}");
            scope.cancel();
            base.release();
            return Err(e);
        }
    };

    // ── Steps 4-5: listener and readiness ─────────────────────────────────────
    let mut handle = spawn_listener(
        callback,
        CALLBACK_CHANNEL,
        Arc::clone(sink),
        scope.clone(),
        id,
    );

    let mut session = EstablishedSession {
        id: id.to_string(),
        features,
        base,
        scope,
        listener: handle.task,
    };

    let readiness = await_readiness(handle.ready, &session.scope, ctx.readiness_timeout).await;
    if let Err(e) = readiness {
        warn!("{id}: could not spawn notify listener: {e}");
        return Err(abort(session, e).await);
    }
    debug!("{id}: listener ready");

    // ── Step 6: snapshot ──────────────────────────────────────────────────────
    if features.snapshot {
        let fetched = within_scope(&session.scope, session.base.fetch_snapshot()).await;
        let snapshot = match fetched {
            Ok(s) => s,
            Err(e) => {
                warn!("{id}: could not acquire initial snapshot: {e}");
                return Err(abort(session, e).await);
            }
        };
        let delivered = within_scope(&session.scope, sink.send_text(snapshot)).await;
        if let Err(e) = delivered {
            debug!("{id}: could not deliver initial snapshot: {e}");
            return Err(abort(session, e).await);
        }
    }
    handle.start.open();

    // ── Step 7: registration ──────────────────────────────────────────────────
    if features.registration {
        let registered = within_scope(&session.scope, session.base.register_session(id)).await;
        if let Err(e) = registered {
            warn!("could not add user {id}: {e}");
            return Err(abort(session, e).await);
        }
    }

    Ok(session)
}

/// Runs `call` unless `scope` is cancelled first.
pub(crate) async fn within_scope<T, F>(
    scope: &CancellationToken,
    call: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(BridgeError::Cancelled),
        res = call => res,
    }
}

/// Waits for the listener's readiness signal, bounded by `limit` and by the
/// session scope.
async fn await_readiness(
    ready: ReadySignal,
    scope: &CancellationToken,
    limit: Duration,
) -> Result<(), BridgeError> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(BridgeError::Cancelled),
        res = tokio::time::timeout(limit, ready) => match res {
            Ok(Ok(signal)) => signal,
            Ok(Err(_)) => Err(BridgeError::SubscribeFailed {
                channel: CALLBACK_CHANNEL.to_string(),
                reason: "listener exited before confirming the subscription".to_string(),
            }),
            Err(_) => Err(BridgeError::ReadinessTimeout(limit)),
        },
    }
}

/// Tears down a half-built session and hands back `err`.
async fn abort<C: Connector>(session: EstablishedSession<C>, err: BridgeError) -> BridgeError {
    session.scope.cancel();
    if err.is_cancellation() {
        session.base.discard();
    } else {
        session.base.release();
    }
    if let Err(join_err) = session.listener.await {
        warn!("{}: listener task panicked: {join_err}", session.id);
    }
    err
}

// ── Tests ─────────────────────────────────────────────────────────────────────
