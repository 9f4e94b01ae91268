//! Notification listener task.
//!
//! Each session runs one listener.  It owns the session's callback lease for
//! its whole life and moves through these states:
//!
//! ```text
//! Created ──► Subscribing ──┬──► Ready ──► Listening ──► Terminated
//!                           └──► Failed ─────────────────► Terminated
//! ```
//!
//! - The outcome of the subscribe step is reported exactly once through the
//!   readiness channel, before anything else happens.
//! - A ready listener forwards nothing until its [`StartGate`] is opened.
//!   Notifications raised in the meantime stay queued on the connection and
//!   are forwarded in order once the gate opens.  Dropping the gate unopened
//!   stops the task.
//! - While listening, every payload is written to the client sink as-is and
//!   in arrival order.  A failed write is logged once; after that the task
//!   keeps draining notifications silently, because the receive loop is the
//!   one that decides the client is gone.
//! - Cancelling the session scope drops the pending wait or write
//!   immediately.  That is a normal exit and is logged at `debug`.
//! - A broken wait ends the task with a warning but does not touch the
//!   session scope, so the client connection stays up.
//!
//! The lease is discarded (never recycled) on exit: a connection that has
//! issued `LISTEN` would carry the subscription into its next user.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::pool::Lease;
use crate::application::ports::{BackendConnection, ClientSink, Connector};
use crate::domain::BridgeError;

/// Lifecycle state of a listener task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Subscribing,
    Ready,
    Failed,
    Listening,
    Terminated,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a listener task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEnd {
    /// The subscribe call failed; the task never listened.
    SubscribeFailed(BridgeError),
    /// The session scope was cancelled.
    Cancelled,
    /// Waiting for a notification failed.
    WaitFailed(BridgeError),
}

/// Final report of a listener task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerExit {
    pub end: ListenerEnd,
    /// State the task was in when it stopped running.
    pub last_state: ListenerState,
    /// Notifications received while listening.
    pub received: u64,
    /// Notifications successfully written to the client.
    pub forwarded: u64,
}

/// Readiness signal: `Ok(())` once subscribed, or the subscribe error.
pub type ReadySignal = oneshot::Receiver<Result<(), BridgeError>>;

/// Opens a ready listener's forwarding to the client.
pub struct StartGate(Option<oneshot::Sender<()>>);

impl StartGate {
    /// Lets the listener start forwarding.  Later calls do nothing.
    pub fn open(&mut self) {
        if let Some(tx) = self.0.take() {
            // The task may already have ended.
            let _ = tx.send(());
        }
    }
}

/// Handles to a running listener task.
pub struct ListenerHandle {
    /// Fires exactly once with the outcome of the subscribe step.
    pub ready: ReadySignal,
    /// Held back until the client has received its first frame.
    pub start: StartGate,
    /// Resolves when the task has terminated and its lease is back in the pool.
    pub task: JoinHandle<ListenerExit>,
}

/// Spawns the listener for one session.
///
/// The task subscribes `lease` to `channel`, signals readiness, waits for the
/// start gate, then forwards notifications to `sink` until `scope` is
/// cancelled or the wait fails.
pub fn spawn_listener<C, S>(
    lease: Lease<C>,
    channel: &str,
    sink: Arc<S>,
    scope: CancellationToken,
    session_id: &str,
) -> ListenerHandle
where
    C: Connector,
    S: ClientSink + ?Sized,
{
    let (ready_tx, ready) = oneshot::channel();
    let (start_tx, start_rx) = oneshot::channel();
    let listener = NotificationListener {
        lease,
        channel: channel.to_string(),
        sink,
        scope,
        session_id: session_id.to_string(),
        state: ListenerState::Created,
        received: 0,
        forwarded: 0,
    };
    let task = tokio::spawn(listener.run(ready_tx, start_rx));
    ListenerHandle {
        ready,
        start: StartGate(Some(start_tx)),
        task,
    }
}

struct NotificationListener<C: Connector, S: ClientSink + ?Sized> {
    lease: Lease<C>,
    channel: String,
    sink: Arc<S>,
    scope: CancellationToken,
    session_id: String,
    state: ListenerState,
    received: u64,
    forwarded: u64,
}

impl<C: Connector, S: ClientSink + ?Sized> NotificationListener<C, S> {
    fn transition(&mut self, next: ListenerState) {
        debug!(
            "{}: listener {} -> {}",
            self.session_id, self.state, next
        );
        self.state = next;
    }

    async fn run(
        mut self,
        ready_tx: oneshot::Sender<Result<(), BridgeError>>,
        start: oneshot::Receiver<()>,
    ) -> ListenerExit {
        self.transition(ListenerState::Subscribing);

        let subscribed = tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(BridgeError::Cancelled),
            res = self.lease.listen(&self.channel) => res,
        };

        let end = match subscribed {
            Err(err) => {
                self.transition(ListenerState::Failed);
                if !err.is_cancellation() {
                    warn!(
                        "{}: could not listen to the notifications of {}: {err}",
                        self.session_id, self.channel
                    );
                }
                // The handshake may already have given up waiting.
                let _ = ready_tx.send(Err(err.clone()));
                if err.is_cancellation() {
                    ListenerEnd::Cancelled
                } else {
                    ListenerEnd::SubscribeFailed(err)
                }
            }
            Ok(()) => {
                self.transition(ListenerState::Ready);
                let _ = ready_tx.send(Ok(()));
                if self.await_start(start).await {
                    self.transition(ListenerState::Listening);
                    self.listen_loop().await
                } else {
                    ListenerEnd::Cancelled
                }
            }
        };

        let last_state = self.state;
        self.transition(ListenerState::Terminated);
        let exit = ListenerExit {
            end,
            last_state,
            received: self.received,
            forwarded: self.forwarded,
        };
        self.lease.discard();
        exit
    }

    /// Whether the gate opened; `false` on cancellation or a dropped gate.
    async fn await_start(&mut self, start: oneshot::Receiver<()>) -> bool {
        tokio::select! {
            biased;
            opened = start => {
                if opened.is_err() {
                    debug!("{}: start gate dropped before opening", self.session_id);
                }
                opened.is_ok()
            }
            _ = self.scope.cancelled() => {
                debug!("{}: listener cancelled before forwarding", self.session_id);
                false
            }
        }
    }

    async fn listen_loop(&mut self) -> ListenerEnd {
        let mut sink_open = true;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.scope.cancelled() => {
                    debug!("{}: listener cancelled", self.session_id);
                    return ListenerEnd::Cancelled;
                }
                res = self.lease.next_notification() => res,
            };

            let notification = match next {
                Ok(n) => n,
                Err(err) => {
                    warn!(
                        "{}: could not wait for notification of {}: {err}",
                        self.session_id, self.channel
                    );
                    return ListenerEnd::WaitFailed(err);
                }
            };
            self.received += 1;

            if !sink_open {
                continue;
            }
            let sent = tokio::select! {
                biased;
                _ = self.scope.cancelled() => {
                    debug!("{}: listener cancelled while forwarding", self.session_id);
                    return ListenerEnd::Cancelled;
                }
                res = self.sink.send_text(notification.payload) => res,
            };
            match sent {
                Ok(()) => self.forwarded += 1,
                Err(err) => {
                    debug!(
                        "{}: could not forward notification, draining silently: {err}",
                        self.session_id
                    );
                    sink_open = false;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
