//! Bounded pool of backend connections handed out as [`Lease`]s.
//!
//! # How the pool keeps its limits
//!
//! - A [`Semaphore`] with `max_leases` permits caps the number of leases
//!   checked out at once.  Every [`Lease`] owns one permit and gives it back
//!   when it is released, discarded, or dropped.
//! - Returned connections wait in an idle queue.  `acquire` reuses the oldest
//!   healthy one; anything past `max_lifetime` or `max_idle`, or reported
//!   closed by the driver, is thrown away instead.
//! - A reaper task ([`LeasePool::spawn_reaper`]) closes idle connections that
//!   expire while nobody is asking for one.
//!
//! # Release semantics
//!
//! [`Lease::release`] and [`Lease::discard`] take the lease by value, so a
//! lease cannot be returned twice.  A lease that is simply dropped is
//! reclaimed as if `discard` had been called: the slot comes back, the
//! connection is closed, and the accounting stays exact.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::application::ports::{BackendConnection, Connector};
use crate::domain::{BridgeError, PoolConfig};

/// Snapshot of the pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Leases handed out since the pool was created.
    pub acquired: u64,
    /// Leases returned (released, discarded or dropped) since creation.
    pub released: u64,
    /// Leases currently checked out.
    pub outstanding: usize,
    /// Connections waiting in the idle queue.
    pub idle: usize,
}

/// A connection plus the timestamps the expiry rules need.
struct Pooled<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
}

impl<T: BackendConnection> Pooled<T> {
    fn is_reusable(&self, config: &PoolConfig, now: Instant) -> bool {
        !self.conn.is_closed()
            && now.duration_since(self.created_at) < config.max_lifetime
            && now.duration_since(self.last_used) < config.max_idle
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<Pooled<C::Conn>>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Pooled<C::Conn>>> {
        // A panic while holding this lock cannot leave the queue half-updated,
        // so a poisoned lock is still safe to use.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pops the first reusable idle connection, dropping expired ones on the way.
    fn take_idle(&self) -> Option<Pooled<C::Conn>> {
        let now = Instant::now();
        let mut idle = self.idle_queue();
        while let Some(pooled) = idle.pop_front() {
            if pooled.is_reusable(&self.config, now) {
                return Some(pooled);
            }
            trace!("dropping expired idle connection");
        }
        None
    }
}

/// A bounded, cloneable handle to a pool of backend connections.
pub struct LeasePool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for LeasePool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> LeasePool<C> {
    /// Creates an empty pool.  Connections are opened lazily by `acquire`.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                slots: Arc::new(Semaphore::new(config.max_leases)),
                config,
                idle: Mutex::new(VecDeque::new()),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// The limits this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out one connection.
    ///
    /// Waits up to `acquire_timeout` for a free slot.  The wait, and the
    /// connect that may follow it, are abandoned as soon as `scope` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::PoolExhausted`] if no slot frees up in time.
    /// - [`BridgeError::BackendUnreachable`] if a new connection is needed and
    ///   cannot be opened.
    /// - [`BridgeError::Cancelled`] if `scope` is cancelled first.
    pub async fn acquire(&self, scope: &CancellationToken) -> Result<Lease<C>, BridgeError> {
        let config = self.inner.config;
        let slots = Arc::clone(&self.inner.slots);

        let waited = tokio::time::timeout(config.acquire_timeout, slots.acquire_owned());
        let permit = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(BridgeError::Cancelled),
            res = waited => match res {
                Ok(Ok(permit)) => permit,
                // The semaphore is never closed; treat it like a full pool anyway.
                Ok(Err(_)) | Err(_) => {
                    return Err(BridgeError::PoolExhausted {
                        max_leases: config.max_leases,
                        waited: config.acquire_timeout,
                    })
                }
            },
        };

        let pooled = match self.inner.take_idle() {
            Some(pooled) => pooled,
            None => {
                let conn = tokio::select! {
                    biased;
                    _ = scope.cancelled() => return Err(BridgeError::Cancelled),
                    res = self.inner.connector.connect() => res?,
                };
                let now = Instant::now();
                Pooled {
                    conn,
                    created_at: now,
                    last_used: now,
                }
            }
        };

        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(Lease {
            pooled: Some(pooled),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Closes every idle connection that is past its lifetime or idle limit.
    ///
    /// Returns the number of connections closed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut idle = self.inner.idle_queue();
        let before = idle.len();
        idle.retain(|pooled| pooled.is_reusable(&self.inner.config, now));
        before - idle.len()
    }

    /// Starts a background task that calls [`reap_idle`](Self::reap_idle)
    /// periodically until `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = reap_period(&pool.inner.config);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = pool.reap_idle();
                        if reaped > 0 {
                            debug!("pool reaper closed {reaped} idle connection(s)");
                        }
                    }
                }
            }
            debug!("pool reaper stopped");
        })
    }

    /// Returns the current accounting.
    pub fn stats(&self) -> PoolStats {
        let max = self.inner.config.max_leases;
        PoolStats {
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            outstanding: max - self.inner.slots.available_permits(),
            idle: self.inner.idle_queue().len(),
        }
    }
}

/// Half the shorter of the two expiry limits, but never below 100 ms.
fn reap_period(config: &PoolConfig) -> Duration {
    let shortest = config.max_idle.min(config.max_lifetime);
    (shortest / 2).max(Duration::from_millis(100))
}

/// Exclusive use of one pooled connection.
///
/// Dereferences to the connection itself.  Hand it back with
/// [`release`](Self::release) (reuse allowed) or [`discard`](Self::discard)
/// (connection closed).
pub struct Lease<C: Connector> {
    pooled: Option<Pooled<C::Conn>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> Lease<C> {
    /// Returns the connection to the idle queue, unless it has expired or
    /// broken, in which case it is closed.
    pub fn release(mut self) {
        self.finish(true);
    }

    /// Closes the connection instead of returning it for reuse.
    pub fn discard(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, recycle: bool) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };
        self.pool.released.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        pooled.last_used = now;
        if recycle && pooled.is_reusable(&self.pool.config, now) {
            self.pool.idle_queue().push_back(pooled);
        } else {
            drop(pooled);
        }

        // The slot is handed back only after the connection is queued, so a
        // waiter woken by the permit finds it.
        drop(self.permit.take());
    }
}

impl<C: Connector> Deref for Lease<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        match &self.pooled {
            Some(pooled) => &pooled.conn,
            None => unreachable!("lease is consumed by release/discard"),
        }
    }
}

impl<C: Connector> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        match &mut self.pooled {
            Some(pooled) => &mut pooled.conn,
            None => unreachable!("lease is consumed by release/discard"),
        }
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.pooled.is_some() {
            debug!("lease dropped without release; discarding its connection");
            self.finish(false);
        }
    }
}

impl<C: Connector> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("held", &self.pooled.is_some())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
