//! Tracked connections: a provider connection plus its lifecycle state.
//!
//! A `TrackedConnection` exclusively owns one provider connection and knows
//! whether it is open, whether it has ever been opened, and whether it is
//! shared. Shared connections carry a lock that every user must hold; the
//! connection is never closed while that lock is held.

use crate::db::blocking;
use crate::db::locker::{AsyncLocker, LockCore, Locker, NOOP_LOCKER};
use crate::db::metrics::ConnectionMetrics;
use crate::db::provider::{DisposeHook, FirstOpenHook, ProviderConnection};
use crate::error::{DbError, DbResult};
use crate::models::LockScope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long dispose waits for a lock holder before logging and retrying.
pub const DISPOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Pause between drain attempts after a grace period elapses.
pub const DISPOSE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct Slot<C> {
    conn: Option<C>,
    is_open: bool,
    ever_opened: bool,
    first_open: Option<FirstOpenHook<C>>,
}

pub struct TrackedConnection<C: ProviderConnection> {
    id: u64,
    slot: Arc<Mutex<Slot<C>>>,
    on_dispose: StdMutex<Option<DisposeHook>>,
    open: AtomicBool,
    disposed: AtomicBool,
    /// Present exactly when the connection is shared.
    lock: Option<Arc<LockCore>>,
    dispose_grace: Duration,
    metrics: Arc<ConnectionMetrics>,
    runtime: Option<Handle>,
    created_at: Instant,
}

impl<C: ProviderConnection> TrackedConnection<C> {
    pub fn builder(id: u64, conn: C) -> TrackedConnectionBuilder<C> {
        TrackedConnectionBuilder {
            id,
            conn,
            shared_lock_timeout: None,
            dispose_grace: DISPOSE_GRACE_PERIOD,
            first_open: None,
            on_dispose: None,
            metrics: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_shared(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The locker guarding this connection.
    ///
    /// Non-shared connections always get the same static no-op locker. Shared
    /// connections get a fresh `AsyncLocker` per call, all over one `LockCore`.
    pub fn get_lock(&self) -> Locker {
        match &self.lock {
            None => Locker::NoOp(&NOOP_LOCKER),
            Some(core) => Locker::Async(AsyncLocker::new(Arc::clone(core))),
        }
    }

    /// Open the connection. No-op when already open.
    ///
    /// The first-open hook runs only on the first transition to open.
    pub async fn open(&self) -> DbResult<()> {
        self.ensure_live()?;
        let mut slot = self.slot.lock().await;
        if slot.is_open {
            return Ok(());
        }

        let slot = &mut *slot;
        let conn = slot.conn.as_mut().ok_or(DbError::ConnectionDisposed {
            connection_id: self.id,
        })?;

        conn.open().await?;
        let first_open = if slot.ever_opened {
            None
        } else {
            slot.first_open.take()
        };
        slot.is_open = true;
        slot.ever_opened = true;
        self.open.store(true, Ordering::SeqCst);
        self.metrics.record_open(self.id);
        debug!(connection_id = self.id, shared = self.is_shared(), "Connection opened");

        if let Some(hook) = first_open {
            hook(conn).await?;
        }
        Ok(())
    }

    /// Close the connection. No-op when already closed. Hooks and lock are kept.
    pub async fn close(&self) -> DbResult<()> {
        let mut slot = self.slot.lock().await;
        self.close_slot(&mut slot).await
    }

    async fn close_slot(&self, slot: &mut Slot<C>) -> DbResult<()> {
        if !slot.is_open {
            return Ok(());
        }
        let result = match slot.conn.as_mut() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        slot.is_open = false;
        self.open.store(false, Ordering::SeqCst);
        self.metrics.record_close(self.id);
        debug!(connection_id = self.id, "Connection closed");
        result
    }

    /// Close and release everything. Idempotent.
    ///
    /// A shared connection is first drained: dispose waits until no task holds
    /// its lock, then refuses all future lockers.
    pub async fn dispose(&self) -> DbResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(core) = &self.lock {
            self.drain(core).await;
        }

        {
            let mut slot = self.slot.lock().await;
            if let Err(e) = self.close_slot(&mut slot).await {
                warn!(
                    connection_id = self.id,
                    error = %e,
                    "Async close failed during dispose, dropping connection"
                );
            }
            // Provider Drop releases whatever the failed close left behind.
            drop(slot.conn.take());
            slot.first_open = None;
        }

        self.run_dispose_hook();
        debug!(
            connection_id = self.id,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "Connection disposed"
        );
        Ok(())
    }

    async fn drain(&self, core: &LockCore) {
        let never = CancellationToken::new();
        loop {
            match core.try_lock(self.dispose_grace, &never).await {
                Ok(Some(guard)) => {
                    core.close();
                    drop(guard);
                    return;
                }
                Ok(None) => {
                    warn!(
                        connection_id = self.id,
                        grace_ms = self.dispose_grace.as_millis() as u64,
                        waiters = core.waiters(),
                        "Shared connection still locked, waiting to dispose"
                    );
                    tokio::time::sleep(DISPOSE_RETRY_DELAY).await;
                }
                Err(_) => {
                    core.close();
                    return;
                }
            }
        }
    }

    fn run_dispose_hook(&self) {
        let hook = match self.on_dispose.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn open_blocking(&self) -> DbResult<()> {
        blocking::wait(self.runtime.as_ref(), self.open())
    }

    pub fn close_blocking(&self) -> DbResult<()> {
        blocking::wait(self.runtime.as_ref(), self.close())
    }

    pub fn dispose_blocking(&self) -> DbResult<()> {
        blocking::wait(self.runtime.as_ref(), self.dispose())
    }

    /// Run a statement on this connection, opening it first if needed.
    ///
    /// Callers of a shared connection must already hold its lock.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        self.open().await?;
        let mut access = self.access().await?;
        access.execute(sql).await
    }

    /// Exclusive access to the provider connection.
    pub async fn access(&self) -> DbResult<ConnectionAccess<C>> {
        self.ensure_live()?;
        let slot = Arc::clone(&self.slot).lock_owned().await;
        OwnedMutexGuard::try_map(slot, |slot| slot.conn.as_mut())
            .map(|guard| ConnectionAccess { guard })
            .map_err(|_| DbError::ConnectionDisposed {
                connection_id: self.id,
            })
    }

    fn ensure_live(&self) -> DbResult<()> {
        if self.is_disposed() {
            return Err(DbError::ConnectionDisposed {
                connection_id: self.id,
            });
        }
        Ok(())
    }
}

impl<C: ProviderConnection> Drop for TrackedConnection<C> {
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        if self.is_open() {
            self.metrics.record_close(self.id);
        }
        self.run_dispose_hook();
    }
}

impl<C: ProviderConnection> std::fmt::Debug for TrackedConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("id", &self.id)
            .field("shared", &self.is_shared())
            .field("open", &self.is_open())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

pub struct TrackedConnectionBuilder<C: ProviderConnection> {
    id: u64,
    conn: C,
    shared_lock_timeout: Option<Duration>,
    dispose_grace: Duration,
    first_open: Option<FirstOpenHook<C>>,
    on_dispose: Option<DisposeHook>,
    metrics: Option<Arc<ConnectionMetrics>>,
}

impl<C: ProviderConnection> TrackedConnectionBuilder<C> {
    /// Mark the connection shared, guarded by a lock with this timeout.
    pub fn shared(mut self, lock_timeout: Duration) -> Self {
        self.shared_lock_timeout = Some(lock_timeout);
        self
    }

    /// How long each dispose attempt waits on a shared lock holder before
    /// logging and retrying. Defaults to [`DISPOSE_GRACE_PERIOD`].
    pub fn dispose_grace_period(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    pub fn on_first_open(mut self, hook: FirstOpenHook<C>) -> Self {
        self.first_open = Some(hook);
        self
    }

    pub fn on_dispose(mut self, hook: DisposeHook) -> Self {
        self.on_dispose = Some(hook);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ConnectionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> TrackedConnection<C> {
        let metrics = self.metrics.unwrap_or_else(ConnectionMetrics::detached);
        let lock = self.shared_lock_timeout.map(|timeout| {
            Arc::new(
                LockCore::new(LockScope::SharedConnection, self.id, timeout)
                    .with_metrics(Arc::clone(&metrics)),
            )
        });
        TrackedConnection {
            id: self.id,
            slot: Arc::new(Mutex::new(Slot {
                conn: Some(self.conn),
                is_open: false,
                ever_opened: false,
                first_open: self.first_open,
            })),
            on_dispose: StdMutex::new(self.on_dispose),
            open: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            lock,
            dispose_grace: self.dispose_grace,
            metrics,
            runtime: Handle::try_current().ok(),
            created_at: Instant::now(),
        }
    }
}

/// Exclusive borrow of a tracked connection's provider connection.
pub struct ConnectionAccess<C> {
    guard: OwnedMappedMutexGuard<Slot<C>, C>,
}

impl<C> std::ops::Deref for ConnectionAccess<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.guard
    }
}

impl<C> std::ops::DerefMut for ConnectionAccess<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.guard
    }
}
