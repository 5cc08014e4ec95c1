//! Pool governor: bounds how many connections of one role are in use at once.
//!
//! A bounded governor is a counting semaphore of `capacity` permits. Each
//! [`PoolPermit`] owns one permit and gives it back when dropped, on every exit
//! path. Waiting is bounded by the acquire timeout; running out of time is a
//! saturation error, reported separately from lock contention.

use crate::db::blocking;
use crate::db::metrics::ConnectionMetrics;
use crate::error::{DbError, DbResult};
use crate::models::{PoolRole, SaturationSnapshot};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

enum Bound {
    Bounded {
        semaphore: Arc<Semaphore>,
        capacity: usize,
    },
    Unbounded {
        in_use: Arc<AtomicUsize>,
    },
}

pub struct PoolGovernor {
    role: PoolRole,
    bound: Bound,
    timeout: Duration,
    waiting: AtomicUsize,
    metrics: Arc<ConnectionMetrics>,
    runtime: Option<Handle>,
}

impl PoolGovernor {
    /// Create a governor with `capacity` permits.
    pub fn new(role: PoolRole, capacity: usize, timeout: Duration) -> DbResult<Self> {
        if capacity == 0 {
            return Err(DbError::configuration(format!(
                "{} pool capacity must be greater than 0",
                role
            )));
        }
        Ok(Self::with_bound(
            role,
            Bound::Bounded {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
            },
            timeout,
        ))
    }

    /// A governor that never waits. Used when governing is disabled.
    pub fn unbounded(role: PoolRole) -> Self {
        Self::with_bound(
            role,
            Bound::Unbounded {
                in_use: Arc::new(AtomicUsize::new(0)),
            },
            Duration::ZERO,
        )
    }

    fn with_bound(role: PoolRole, bound: Bound, timeout: Duration) -> Self {
        Self {
            role,
            bound,
            timeout,
            waiting: AtomicUsize::new(0),
            metrics: ConnectionMetrics::detached(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ConnectionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match &self.bound {
            Bound::Bounded { capacity, .. } => Some(*capacity),
            Bound::Unbounded { .. } => None,
        }
    }

    pub fn in_use(&self) -> usize {
        match &self.bound {
            Bound::Bounded {
                semaphore,
                capacity,
            } => capacity.saturating_sub(semaphore.available_permits()),
            Bound::Unbounded { in_use } => in_use.load(Ordering::SeqCst),
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire a permit, waiting at most the configured timeout.
    pub async fn acquire(&self, cancel: &CancellationToken) -> DbResult<PoolPermit> {
        let (semaphore, capacity) = match &self.bound {
            Bound::Unbounded { in_use } => {
                in_use.fetch_add(1, Ordering::SeqCst);
                return Ok(PoolPermit {
                    role: self.role,
                    held: Permit::Unbounded(Arc::clone(in_use)),
                });
            }
            Bound::Bounded {
                semaphore,
                capacity,
            } => (semaphore, *capacity),
        };

        let started = Instant::now();
        match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(self.granted(permit, started)),
            Err(TryAcquireError::Closed) => return Err(DbError::ContextClosed),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = tokio::time::timeout(self.timeout, Arc::clone(semaphore).acquire_owned()) => {
                Some(acquired)
            }
        };
        let waiting = self.waiting.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            None => Err(DbError::cancelled(format!("{} permit", self.role))),
            Some(Ok(Ok(permit))) => Ok(self.granted(permit, started)),
            Some(Ok(Err(_))) => Err(DbError::ContextClosed),
            Some(Err(_elapsed)) => {
                let snapshot = SaturationSnapshot {
                    role: self.role,
                    capacity,
                    in_use: self.in_use(),
                    waiting,
                    timeout: self.timeout,
                };
                self.metrics.record_saturation(&snapshot);
                warn!(
                    role = %self.role,
                    capacity,
                    in_use = snapshot.in_use,
                    waiting,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Pool saturated"
                );
                Err(DbError::PoolSaturated { snapshot })
            }
        }
    }

    pub fn acquire_blocking(&self, cancel: &CancellationToken) -> DbResult<PoolPermit> {
        blocking::wait(self.runtime.as_ref(), self.acquire(cancel))
    }

    /// Refuse all future acquisitions. Outstanding permits stay valid.
    pub(crate) fn close(&self) {
        if let Bound::Bounded { semaphore, .. } = &self.bound {
            semaphore.close();
        }
    }

    fn granted(&self, permit: OwnedSemaphorePermit, started: Instant) -> PoolPermit {
        let waited = started.elapsed();
        self.metrics.sink().permit_acquired(self.role, waited);
        debug!(
            role = %self.role,
            in_use = self.in_use(),
            waited_ms = waited.as_millis() as u64,
            "Permit acquired"
        );
        PoolPermit {
            role: self.role,
            held: Permit::Bounded(permit),
        }
    }
}

impl std::fmt::Debug for PoolGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGovernor")
            .field("role", &self.role)
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .field("waiting", &self.waiting())
            .field("timeout", &self.timeout)
            .finish()
    }
}

enum Permit {
    Bounded(OwnedSemaphorePermit),
    Unbounded(Arc<AtomicUsize>),
}

/// One unit of governor capacity, returned exactly once.
#[must_use = "the permit is returned as soon as it is dropped"]
pub struct PoolPermit {
    role: PoolRole,
    held: Permit,
}

impl PoolPermit {
    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// Return the permit now. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Permit::Unbounded(in_use) = &self.held {
            in_use.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        let err = PoolGovernor::new(PoolRole::Reader, 0, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let governor = PoolGovernor::new(PoolRole::Writer, 2, Duration::from_millis(50)).unwrap();
        let cancel = CancellationToken::new();

        let a = governor.acquire(&cancel).await.unwrap();
        let b = governor.acquire(&cancel).await.unwrap();
        assert_eq!(governor.in_use(), 2);

        a.release();
        assert_eq!(governor.in_use(), 1);
        drop(b);
        assert_eq!(governor.in_use(), 0);
    }

    #[tokio::test]
    async fn test_saturation_snapshot() {
        let governor = PoolGovernor::new(PoolRole::Reader, 1, Duration::from_millis(30)).unwrap();
        let cancel = CancellationToken::new();
        let _held = governor.acquire(&cancel).await.unwrap();

        let err = governor.acquire(&cancel).await.unwrap_err();
        let snapshot = err.saturation().unwrap();
        assert_eq!(snapshot.role, PoolRole::Reader);
        assert_eq!(snapshot.capacity, 1);
        assert_eq!(snapshot.in_use, 1);
        assert_eq!(snapshot.waiting, 1);
        assert_eq!(governor.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_permit() {
        let governor =
            Arc::new(PoolGovernor::new(PoolRole::Reader, 1, Duration::from_secs(2)).unwrap());
        let cancel = CancellationToken::new();
        let held = governor.acquire(&cancel).await.unwrap();

        let waiter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                governor.acquire(&cancel).await.map(|p| p.role())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();
        assert_eq!(waiter.await.unwrap().unwrap(), PoolRole::Reader);
    }

    #[tokio::test]
    async fn test_cancel_leaves_nothing_acquired() {
        let governor = PoolGovernor::new(PoolRole::Writer, 1, Duration::from_secs(5)).unwrap();
        let held = governor.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = governor.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));

        drop(held);
        assert_eq!(governor.in_use(), 0);
        assert_eq!(governor.waiting(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_counts_in_use() {
        let governor = PoolGovernor::unbounded(PoolRole::Reader);
        let cancel = CancellationToken::new();
        let permits: Vec<_> = futures_util::future::join_all((0..50).map(|_| governor.acquire(&cancel)))
            .await
            .into_iter()
            .collect::<DbResult<_>>()
            .unwrap();
        assert_eq!(governor.in_use(), 50);
        assert!(governor.capacity().is_none());
        drop(permits);
        assert_eq!(governor.in_use(), 0);
    }
}
