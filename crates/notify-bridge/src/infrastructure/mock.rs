//! In-memory implementations of the ports, for tests.
//!
//! - [`MockBackend`] stands in for the database: it opens fake connections,
//!   delivers published notifications to every listening connection, records
//!   each backend call, and can be told to fail any step.
//! - [`RecordingSink`] stands in for the client socket's write half.
//! - [`ScriptedSource`] stands in for the read half; frames are pushed into it
//!   through a [`SourceFeeder`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::application::ports::{BackendConnection, ClientSink, ClientSource, Connector};
use crate::domain::{BackendCall, BridgeError, InboundFrame, Notification, CALLBACK_CHANNEL};

/// A backend call observed by [`MockBackend`], in the order it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connected,
    Listened,
    SnapshotFetched,
    Registered(String),
    Deregistered(String),
    Persisted { session_id: String, payload: String },
    ScriptExecuted,
}

#[derive(Debug, Clone)]
enum BusMessage {
    Notify(Notification),
    Break(String),
}

struct MockState {
    events: Vec<BackendEvent>,
    snapshot: String,
    failing: HashSet<BackendCall>,
    hanging: HashSet<BackendCall>,
    snapshot_side_effect: Option<String>,
    persist_poison: Option<String>,
    listen_delay: Duration,
    fail_connect: bool,
    generation: u64,
    registered: Vec<String>,
}

struct Inner {
    state: Mutex<MockState>,
    bus: broadcast::Sender<BusMessage>,
    opened: AtomicU64,
    closed: AtomicU64,
    delivered: AtomicU64,
    changed: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("lock poisoned")
    }

    fn record(&self, event: BackendEvent) {
        self.state().events.push(event);
        self.changed.notify_waiters();
    }

    fn check(&self, call: BackendCall) -> Result<(), BridgeError> {
        if self.state().failing.contains(&call) {
            Err(BridgeError::call_failed(call, "mock failure"))
        } else {
            Ok(())
        }
    }

    /// Like `check`, but never returns while `call` is set to hang.
    async fn enter(&self, call: BackendCall) -> Result<(), BridgeError> {
        let hangs = self.state().hanging.contains(&call);
        if hangs {
            std::future::pending::<()>().await;
        }
        self.check(call)
    }

    fn publish(&self, payload: &str) {
        let _ = self
            .bus
            .send(BusMessage::Notify(Notification::new(CALLBACK_CHANNEL, payload)));
    }
}

/// A fake database with one notification bus.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MockState {
                    events: Vec::new(),
                    snapshot: "[]".to_string(),
                    failing: HashSet::new(),
                    hanging: HashSet::new(),
                    snapshot_side_effect: None,
                    persist_poison: None,
                    listen_delay: Duration::ZERO,
                    fail_connect: false,
                    generation: 0,
                    registered: Vec::new(),
                }),
                bus,
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                changed: Notify::new(),
            }),
        }
    }

    // ── Knobs ─────────────────────────────────────────────────────────────────

    /// Makes `connect` fail with `BackendUnreachable`.
    pub fn fail_connect(&self, fail: bool) {
        self.inner.state().fail_connect = fail;
    }

    /// Makes `listen` fail with `SubscribeFailed`.
    pub fn fail_listen(&self, fail: bool) {
        self.fail_call(BackendCall::Listen, fail);
    }

    /// Makes the given backend call fail (or succeed again).
    pub fn fail_call(&self, call: BackendCall, fail: bool) {
        let mut state = self.inner.state();
        if fail {
            state.failing.insert(call);
        } else {
            state.failing.remove(&call);
        }
    }

    /// Makes the given backend call never answer (or answer again).
    pub fn hang_call(&self, call: BackendCall, hang: bool) {
        let mut state = self.inner.state();
        if hang {
            state.hanging.insert(call);
        } else {
            state.hanging.remove(&call);
        }
    }

    /// Makes `persist` fail for payloads containing `needle`.
    pub fn fail_persist_containing(&self, needle: &str) {
        self.inner.state().persist_poison = Some(needle.to_string());
    }

    /// Delays every `listen` call by `delay` before it completes.
    pub fn set_listen_delay(&self, delay: Duration) {
        self.inner.state().listen_delay = delay;
    }

    /// Sets the text returned by `fetch_snapshot`.
    pub fn set_snapshot(&self, snapshot: &str) {
        self.inner.state().snapshot = snapshot.to_string();
    }

    /// Makes the next `fetch_snapshot` publish `payload` and linger briefly
    /// before answering, as if another session changed data mid-query.
    pub fn publish_while_fetching_snapshot(&self, payload: &str) {
        self.inner.state().snapshot_side_effect = Some(payload.to_string());
    }

    /// Publishes `payload` on the callback channel.
    pub fn publish(&self, payload: &str) {
        self.inner.publish(payload);
    }

    /// Makes every pending and future `next_notification` call on the current
    /// listeners fail.
    pub fn break_listeners(&self, reason: &str) {
        let _ = self.inner.bus.send(BusMessage::Break(reason.to_string()));
    }

    /// Marks every connection opened so far as closed.
    pub fn sever_all(&self) {
        self.inner.state().generation += 1;
    }

    // ── Observations ──────────────────────────────────────────────────────────

    pub fn events(&self) -> Vec<BackendEvent> {
        self.inner.state().events.clone()
    }

    /// Session ids currently registered.
    pub fn registered_sessions(&self) -> Vec<String> {
        self.inner.state().registered.clone()
    }

    pub fn connections_opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Waits until `event` has been recorded.
    ///
    /// Panics if it does not show up within `limit`.
    pub async fn wait_for_event(&self, event: &BackendEvent, limit: Duration) {
        self.wait_until(limit, || self.inner.state().events.contains(event))
            .await
            .unwrap_or_else(|()| panic!("{event:?} not recorded within {limit:?}"));
    }

    /// Waits until `count` notifications have been handed to listeners.
    ///
    /// Panics if that does not happen within `limit`.
    pub async fn wait_until_delivered(&self, count: u64, limit: Duration) {
        self.wait_until(limit, || self.inner.delivered.load(Ordering::SeqCst) >= count)
            .await
            .unwrap_or_else(|()| panic!("{count} notification(s) not delivered within {limit:?}"));
    }

    async fn wait_until(&self, limit: Duration, done: impl Fn() -> bool) -> Result<(), ()> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let changed = self.inner.changed.notified();
            if done() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return if done() { Ok(()) } else { Err(()) };
            }
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockBackend {
    type Conn = MockConnection;

    async fn connect(&self) -> Result<MockConnection, BridgeError> {
        let generation = {
            let state = self.inner.state();
            if state.fail_connect {
                return Err(BridgeError::BackendUnreachable(
                    "mock backend refused the connection".to_string(),
                ));
            }
            state.generation
        };
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.record(BackendEvent::Connected);
        Ok(MockConnection {
            inner: Arc::clone(&self.inner),
            generation,
            subscription: None,
            channels: Vec::new(),
        })
    }
}

/// One fake connection handed out by [`MockBackend`].
pub struct MockConnection {
    inner: Arc<Inner>,
    generation: u64,
    subscription: Option<broadcast::Receiver<BusMessage>>,
    channels: Vec<String>,
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), BridgeError> {
        let delay = self.inner.state().listen_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.check(BackendCall::Listen).is_err() {
            return Err(BridgeError::SubscribeFailed {
                channel: channel.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        if self.subscription.is_none() {
            self.subscription = Some(self.inner.bus.subscribe());
        }
        self.channels.push(channel.to_string());
        self.inner.record(BackendEvent::Listened);
        Ok(())
    }

    async fn next_notification(&mut self) -> Result<Notification, BridgeError> {
        let Some(rx) = self.subscription.as_mut() else {
            // Nothing to wait for; a real connection would block forever too.
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok(BusMessage::Notify(n)) if self.channels.contains(&n.channel) => {
                    self.inner.delivered.fetch_add(1, Ordering::SeqCst);
                    self.inner.changed.notify_waiters();
                    return Ok(n);
                }
                Ok(BusMessage::Notify(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Ok(BusMessage::Break(reason)) => {
                    return Err(BridgeError::NotificationWaitFailed(reason));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BridgeError::NotificationWaitFailed(
                        "notification bus closed".to_string(),
                    ));
                }
            }
        }
    }

    async fn fetch_snapshot(&mut self) -> Result<String, BridgeError> {
        self.inner.enter(BackendCall::FetchSnapshot).await?;
        let side_effect = self.inner.state().snapshot_side_effect.take();
        if let Some(payload) = side_effect {
            self.inner.publish(&payload);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let snapshot = self.inner.state().snapshot.clone();
        self.inner.record(BackendEvent::SnapshotFetched);
        Ok(snapshot)
    }

    async fn register_session(&mut self, session_id: &str) -> Result<(), BridgeError> {
        self.inner.enter(BackendCall::RegisterSession).await?;
        self.inner.state().registered.push(session_id.to_string());
        self.inner.record(BackendEvent::Registered(session_id.to_string()));
        Ok(())
    }

    async fn deregister_session(&mut self, session_id: &str) -> Result<(), BridgeError> {
        self.inner.enter(BackendCall::DeregisterSession).await?;
        self.inner.state().registered.retain(|id| id != session_id);
        self.inner.record(BackendEvent::Deregistered(session_id.to_string()));
        Ok(())
    }

    async fn persist(&mut self, session_id: &str, payload: &str) -> Result<(), BridgeError> {
        self.inner.enter(BackendCall::Persist).await?;
        let poisoned = self
            .inner
            .state()
            .persist_poison
            .as_deref()
            .is_some_and(|needle| payload.contains(needle));
        if poisoned {
            return Err(BridgeError::call_failed(
                BackendCall::Persist,
                "invalid input syntax for type json",
            ));
        }
        self.inner.record(BackendEvent::Persisted {
            session_id: session_id.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn execute_script(&mut self, _script: &str) -> Result<(), BridgeError> {
        self.inner.enter(BackendCall::ExecuteScript).await?;
        self.inner.record(BackendEvent::ScriptExecuted);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.generation < self.inner.state().generation
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Client socket stand-ins ───────────────────────────────────────────────────

/// Records every frame written to it.
pub struct RecordingSink {
    frames: Mutex<Vec<String>>,
    closed: AtomicBool,
    stalled: AtomicBool,
    changed: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Makes every further `send_text` and `close` block forever, like a
    /// client that stopped reading.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Makes every further `send_text` fail with `SocketClosed`.
    pub fn close_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().expect("lock poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` frames were written.
    ///
    /// Panics if that does not happen within `limit`.
    pub async fn wait_for_frames(&self, count: usize, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let changed = self.changed.notified();
            if self.frames.lock().expect("lock poisoned").len() >= count {
                return;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                panic!("expected {count} frame(s), got {:?}", self.frames());
            }
        }
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn send_text(&self, text: String) -> Result<(), BridgeError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_closed() {
            return Err(BridgeError::SocketClosed);
        }
        self.frames.lock().expect("lock poisoned").push(text);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.close_now();
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// Pushes frames into a [`ScriptedSource`].  Dropping it ends the stream.
#[derive(Clone)]
pub struct SourceFeeder {
    tx: mpsc::UnboundedSender<Result<InboundFrame, BridgeError>>,
}

impl SourceFeeder {
    pub fn text(&self, text: &str) {
        let _ = self.tx.send(Ok(InboundFrame::Text(text.to_string())));
    }

    pub fn binary(&self, len: usize) {
        let _ = self.tx.send(Ok(InboundFrame::Binary(len)));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Ok(InboundFrame::Closed));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .tx
            .send(Err(BridgeError::SocketReadFailed(reason.to_string())));
    }
}

/// A client read half driven by a [`SourceFeeder`].
pub struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<Result<InboundFrame, BridgeError>>,
}

impl ScriptedSource {
    pub fn new() -> (Self, SourceFeeder) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, SourceFeeder { tx })
    }
}

#[async_trait]
impl ClientSource for ScriptedSource {
    async fn recv(&mut self) -> Result<InboundFrame, BridgeError> {
        match self.rx.recv().await {
            Some(frame) => frame,
            None => Ok(InboundFrame::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_listening_connection_only() {
        // Arrange
        let backend = MockBackend::new();
        let mut listening = backend.connect().await.unwrap();
        let mut idle = backend.connect().await.unwrap();
        listening.listen(CALLBACK_CHANNEL).await.unwrap();

        // Act
        backend.publish("hello");

        // Assert
        let n = listening.next_notification().await.unwrap();
        assert_eq!(n.payload, "hello");
        let idle_wait =
            tokio::time::timeout(Duration::from_millis(20), idle.next_notification()).await;
        assert!(idle_wait.is_err(), "non-listening connection must not receive");
    }

    #[tokio::test]
    async fn test_fail_call_is_reported_with_call_name() {
        let backend = MockBackend::new();
        backend.fail_call(BackendCall::RegisterSession, true);
        let mut conn = backend.connect().await.unwrap();

        let err = conn.register_session("a").await.unwrap_err();

        assert!(matches!(
            err,
            BridgeError::BackendCallFailed { call: BackendCall::RegisterSession, .. }
        ));
    }

    #[tokio::test]
    async fn test_hanging_call_never_answers() {
        let backend = MockBackend::new();
        backend.hang_call(BackendCall::Persist, true);
        let mut conn = backend.connect().await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(30), conn.persist("a", "{}")).await;

        assert!(waited.is_err());
        assert!(!backend
            .events()
            .iter()
            .any(|e| matches!(e, BackendEvent::Persisted { .. })));
    }

    #[tokio::test]
    async fn test_dropping_connection_counts_as_closed() {
        let backend = MockBackend::new();
        drop(backend.connect().await.unwrap());
        assert_eq!(backend.connections_opened(), 1);
        assert_eq!(backend.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_scripted_source_reports_closed_when_feeder_dropped() {
        let (mut source, feeder) = ScriptedSource::new();
        feeder.binary(4);
        drop(feeder);

        assert_eq!(source.recv().await.unwrap(), InboundFrame::Binary(4));
        assert_eq!(source.recv().await.unwrap(), InboundFrame::Closed);
    }
}
