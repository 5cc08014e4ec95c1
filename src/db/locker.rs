//! Exclusive locks over shared resources.
//!
//! Non-shared connections get the stateless [`NoOpLocker`]. A pinned, shared
//! connection (and the single-writer gate) gets an [`AsyncLocker`] backed by a
//! one-permit semaphore. Any number of `AsyncLocker`s may point at the same
//! [`LockCore`]; they all exclude each other.
//!
//! The lock is not reentrant: a holder that asks again waits out the timeout.

use crate::db::blocking;
use crate::db::metrics::ConnectionMetrics;
use crate::error::{DbError, DbResult};
use crate::models::{ContentionSnapshot, LockScope};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Holds longer than this are logged at `warn`.
pub const LONG_HOLD_WARN: Duration = Duration::from_secs(2);

/// The shared state behind every `AsyncLocker` of one resource.
pub struct LockCore {
    semaphore: Arc<Semaphore>,
    scope: LockScope,
    /// Connection id for shared-connection locks, 0 for the writer gate.
    resource_id: u64,
    timeout: Duration,
    waiters: AtomicUsize,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    metrics: Arc<ConnectionMetrics>,
    runtime: Option<Handle>,
}

impl LockCore {
    pub fn new(scope: LockScope, resource_id: u64, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            scope,
            resource_id,
            timeout,
            waiters: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            metrics: ConnectionMetrics::detached(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ConnectionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether some guard currently holds the lock.
    pub fn is_locked(&self) -> bool {
        !self.semaphore.is_closed() && self.semaphore.available_permits() == 0
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn total_acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn total_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    /// Acquire with the configured timeout, failing with `LockTimeout`.
    pub async fn lock(&self, cancel: &CancellationToken) -> DbResult<LockGuard> {
        let started = Instant::now();
        match self.acquire(self.timeout, cancel).await? {
            Acquired::Guard(guard) => Ok(guard),
            Acquired::TimedOut { waiters } => {
                let snapshot = self.snapshot(waiters, started.elapsed());
                self.metrics.record_lock_timeout(&snapshot);
                warn!(
                    scope = %self.scope,
                    resource_id = self.resource_id,
                    waiters = snapshot.waiters,
                    waited_ms = snapshot.waited.as_millis() as u64,
                    "Lock acquisition timed out"
                );
                Err(DbError::LockTimeout { snapshot })
            }
        }
    }

    /// Acquire within `timeout`, returning `None` when it elapses.
    pub async fn try_lock(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DbResult<Option<LockGuard>> {
        match self.acquire(timeout, cancel).await? {
            Acquired::Guard(guard) => Ok(Some(guard)),
            Acquired::TimedOut { .. } => Ok(None),
        }
    }

    async fn acquire(&self, timeout: Duration, cancel: &CancellationToken) -> DbResult<Acquired> {
        let started = Instant::now();

        // A free permit is never handed past queued waiters, so this keeps FIFO order.
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(Acquired::Guard(self.guard(permit, started))),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = tokio::time::timeout(
                timeout,
                Arc::clone(&self.semaphore).acquire_owned(),
            ) => Some(acquired),
        };
        let waiters = self.waiters.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            None => Err(DbError::cancelled(self.scope.to_string())),
            Some(Ok(Ok(permit))) => Ok(Acquired::Guard(self.guard(permit, started))),
            Some(Ok(Err(_))) => Err(self.closed_error()),
            Some(Err(_elapsed)) => {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                Ok(Acquired::TimedOut { waiters })
            }
        }
    }

    fn guard(&self, permit: OwnedSemaphorePermit, started: Instant) -> LockGuard {
        let waited = started.elapsed();
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.metrics.sink().lock_acquired(self.scope, waited);
        debug!(
            scope = %self.scope,
            resource_id = self.resource_id,
            waited_ms = waited.as_millis() as u64,
            "Lock acquired"
        );
        LockGuard {
            held: Some(Held {
                _permit: permit,
                scope: self.scope,
                resource_id: self.resource_id,
                acquired_at: Instant::now(),
                metrics: Arc::clone(&self.metrics),
            }),
        }
    }

    fn snapshot(&self, waiters: usize, waited: Duration) -> ContentionSnapshot {
        ContentionSnapshot {
            scope: self.scope,
            waiters,
            waited,
            timeout: self.timeout,
            total_acquisitions: self.total_acquisitions(),
            total_timeouts: self.total_timeouts(),
        }
    }

    fn closed_error(&self) -> DbError {
        match self.scope {
            LockScope::SharedConnection => DbError::ConnectionDisposed {
                connection_id: self.resource_id,
            },
            LockScope::WriterGate => DbError::ContextClosed,
        }
    }

    /// Refuse all future acquisitions. Outstanding guards stay valid.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    pub(crate) fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }
}

impl std::fmt::Debug for LockCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCore")
            .field("scope", &self.scope)
            .field("resource_id", &self.resource_id)
            .field("timeout", &self.timeout)
            .field("locked", &self.is_locked())
            .field("waiters", &self.waiters())
            .finish_non_exhaustive()
    }
}

enum Acquired {
    Guard(LockGuard),
    TimedOut { waiters: usize },
}

/// The stateless locker handed out for non-shared connections.
#[derive(Debug)]
pub struct NoOpLocker;

/// The single no-op locker instance.
pub static NOOP_LOCKER: NoOpLocker = NoOpLocker;

/// A handle onto a shared [`LockCore`].
#[derive(Debug, Clone)]
pub struct AsyncLocker {
    core: Arc<LockCore>,
}

impl AsyncLocker {
    pub fn new(core: Arc<LockCore>) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &Arc<LockCore> {
        &self.core
    }
}

/// Lock for one connection, chosen by whether the connection is shared.
#[derive(Debug, Clone)]
pub enum Locker {
    NoOp(&'static NoOpLocker),
    Async(AsyncLocker),
}

impl Locker {
    pub async fn lock(&self, cancel: &CancellationToken) -> DbResult<LockGuard> {
        match self {
            Locker::NoOp(_) => Ok(LockGuard::noop()),
            Locker::Async(locker) => locker.core.lock(cancel).await,
        }
    }

    pub async fn try_lock(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DbResult<Option<LockGuard>> {
        match self {
            Locker::NoOp(_) => Ok(Some(LockGuard::noop())),
            Locker::Async(locker) => locker.core.try_lock(timeout, cancel).await,
        }
    }

    pub fn lock_blocking(&self, cancel: &CancellationToken) -> DbResult<LockGuard> {
        match self {
            Locker::NoOp(_) => Ok(LockGuard::noop()),
            Locker::Async(locker) => {
                blocking::wait(locker.core.runtime(), locker.core.lock(cancel))
            }
        }
    }

    pub fn try_lock_blocking(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DbResult<Option<LockGuard>> {
        match self {
            Locker::NoOp(_) => Ok(Some(LockGuard::noop())),
            Locker::Async(locker) => blocking::wait(
                locker.core.runtime(),
                locker.core.try_lock(timeout, cancel),
            ),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Locker::NoOp(_))
    }

    /// True when both lockers guard the same resource (or are both the no-op locker).
    pub fn same_resource(&self, other: &Locker) -> bool {
        match (self, other) {
            (Locker::NoOp(a), Locker::NoOp(b)) => std::ptr::eq(*a, *b),
            (Locker::Async(a), Locker::Async(b)) => Arc::ptr_eq(&a.core, &b.core),
            _ => false,
        }
    }
}

/// Proof of exclusive access. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    held: Option<Held>,
}

struct Held {
    _permit: OwnedSemaphorePermit,
    scope: LockScope,
    resource_id: u64,
    acquired_at: Instant,
    metrics: Arc<ConnectionMetrics>,
}

impl LockGuard {
    fn noop() -> Self {
        Self { held: None }
    }

    pub fn is_noop(&self) -> bool {
        self.held.is_none()
    }

    pub fn held_for(&self) -> Duration {
        self.held
            .as_ref()
            .map(|held| held.acquired_at.elapsed())
            .unwrap_or_default()
    }

    /// Release now. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let held_for = held.acquired_at.elapsed();
        held.metrics.sink().lock_released(held.scope, held_for);

        let held_ms = held_for.as_millis() as u64;
        if held_for > LONG_HOLD_WARN {
            warn!(
                scope = %held.scope,
                resource_id = held.resource_id,
                held_ms,
                "Lock held for an extended period"
            );
        } else {
            debug!(
                scope = %held.scope,
                resource_id = held.resource_id,
                held_ms,
                "Lock released"
            );
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("noop", &self.is_noop())
            .field("held_for", &self.held_for())
            .finish()
    }
}
