//! Passive metrics hooks and the live counters behind `ContextMetrics`.
//!
//! The core only ever calls into a [`MetricsSink`]; it never reads back from it.
//! Counters that the core itself reports live in [`ConnectionMetrics`].

use crate::models::{ContentionSnapshot, LockScope, PoolRole, SaturationSnapshot};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Callbacks for an external metrics layer. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait MetricsSink: Send + Sync + 'static {
    fn connection_opened(&self, connection_id: u64, open_now: u64) {}

    fn connection_closed(&self, connection_id: u64, open_now: u64) {}

    fn lock_acquired(&self, scope: LockScope, waited: Duration) {}

    fn lock_released(&self, scope: LockScope, held: Duration) {}

    fn lock_timed_out(&self, snapshot: &ContentionSnapshot) {}

    fn permit_acquired(&self, role: PoolRole, waited: Duration) {}

    fn pool_saturated(&self, snapshot: &SaturationSnapshot) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Emits every event as a `tracing` event under the `db_context::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn connection_opened(&self, connection_id: u64, open_now: u64) {
        trace!(target: "db_context::metrics", connection_id, open_now, "connection opened");
    }

    fn connection_closed(&self, connection_id: u64, open_now: u64) {
        trace!(target: "db_context::metrics", connection_id, open_now, "connection closed");
    }

    fn lock_acquired(&self, scope: LockScope, waited: Duration) {
        trace!(
            target: "db_context::metrics",
            scope = %scope,
            waited_ms = waited.as_millis() as u64,
            "lock acquired"
        );
    }

    fn lock_released(&self, scope: LockScope, held: Duration) {
        trace!(
            target: "db_context::metrics",
            scope = %scope,
            held_ms = held.as_millis() as u64,
            "lock released"
        );
    }

    fn lock_timed_out(&self, snapshot: &ContentionSnapshot) {
        debug!(
            target: "db_context::metrics",
            scope = %snapshot.scope,
            waiters = snapshot.waiters,
            waited_ms = snapshot.waited.as_millis() as u64,
            "lock timed out"
        );
    }

    fn permit_acquired(&self, role: PoolRole, waited: Duration) {
        trace!(
            target: "db_context::metrics",
            role = %role,
            waited_ms = waited.as_millis() as u64,
            "permit acquired"
        );
    }

    fn pool_saturated(&self, snapshot: &SaturationSnapshot) {
        debug!(
            target: "db_context::metrics",
            role = %snapshot.role,
            in_use = snapshot.in_use,
            capacity = snapshot.capacity,
            "pool saturated"
        );
    }
}

/// Atomic counters shared by every component of one context.
pub struct ConnectionMetrics {
    sink: Arc<dyn MetricsSink>,
    current_open: AtomicU64,
    peak_open: AtomicU64,
    total_opened: AtomicU64,
    lock_timeouts: AtomicU64,
    pool_saturations: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            current_open: AtomicU64::new(0),
            peak_open: AtomicU64::new(0),
            total_opened: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            pool_saturations: AtomicU64::new(0),
        }
    }

    /// Counters with no external sink.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sink(&self) -> &dyn MetricsSink {
        self.sink.as_ref()
    }

    pub(crate) fn record_open(&self, connection_id: u64) {
        let now = self.current_open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_open.fetch_max(now, Ordering::SeqCst);
        self.total_opened.fetch_add(1, Ordering::SeqCst);
        self.sink.connection_opened(connection_id, now);
    }

    pub(crate) fn record_close(&self, connection_id: u64) {
        let now = self
            .current_open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0);
        self.sink.connection_closed(connection_id, now);
    }

    pub(crate) fn record_lock_timeout(&self, snapshot: &ContentionSnapshot) {
        self.lock_timeouts.fetch_add(1, Ordering::SeqCst);
        self.sink.lock_timed_out(snapshot);
    }

    pub(crate) fn record_saturation(&self, snapshot: &SaturationSnapshot) {
        self.pool_saturations.fetch_add(1, Ordering::SeqCst);
        self.sink.pool_saturated(snapshot);
    }

    pub fn current_open(&self) -> u64 {
        self.current_open.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> u64 {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn total_opened(&self) -> u64 {
        self.total_opened.load(Ordering::SeqCst)
    }

    pub fn lock_timeouts(&self) -> u64 {
        self.lock_timeouts.load(Ordering::SeqCst)
    }

    pub fn pool_saturations(&self) -> u64 {
        self.pool_saturations.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl std::fmt::Debug for ConnectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMetrics")
            .field("current_open", &self.current_open())
            .field("peak_open", &self.peak_open())
            .field("total_opened", &self.total_opened())
            .field("lock_timeouts", &self.lock_timeouts())
            .field("pool_saturations", &self.pool_saturations())
            .finish_non_exhaustive()
    }
}
