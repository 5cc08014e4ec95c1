//! Database context: the per-database orchestrator.
//!
//! A context resolves its connection mode once, at construction, and from then
//! on decides for every request whether it gets a fresh connection, the pinned
//! shared connection, or a fresh connection behind the single-writer gate.
//!
//! Acquisition order is gate, permit, connection, lock. Release runs the
//! other way: lock, connection, permit, gate.

use crate::config::ContextOptions;
use crate::db::blocking;
use crate::db::classify;
use crate::db::governor::{PoolGovernor, PoolPermit};
use crate::db::locker::LockGuard;
use crate::db::metrics::{ConnectionMetrics, MetricsSink, NoopMetrics};
use crate::db::provider::{
    ConnectionFactory, ConnectionIntent, FirstOpenHook, ProviderConnection, first_open_hook,
};
use crate::db::sqlx_provider::SqlxFactory;
use crate::db::strategy::{ConnectionPlan, ModeResolver};
use crate::db::tracked::{ConnectionAccess, TrackedConnection};
use crate::db::writer_gate::{WriterGate, WriterTicket};
use crate::error::{DbError, DbResult};
use crate::models::{
    ContextMetrics, DbMode, ExecutionType, PoolRole, ReadWriteMode, SupportedDatabase,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Shared<C> = Arc<TrackedConnection<C>>;

struct ContextInner<F: ConnectionFactory> {
    id: Arc<str>,
    factory: F,
    options: ContextOptions,
    requested_mode: DbMode,
    mode: DbMode,
    read_write_mode: ReadWriteMode,
    readers: PoolGovernor,
    writers: PoolGovernor,
    gate: Option<WriterGate>,
    pinned: Mutex<Option<Shared<F::Connection>>>,
    /// Write permit held by the pinned connection for the context lifetime.
    pinned_permit: Mutex<Option<PoolPermit>>,
    sentinel: Mutex<Option<Shared<F::Connection>>>,
    metrics: Arc<ConnectionMetrics>,
    live: Arc<AtomicU64>,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
    runtime: Handle,
    created_at: DateTime<Utc>,
}

/// Per-database orchestrator. Cheap to clone; clones share all state.
pub struct DatabaseContext<F: ConnectionFactory> {
    inner: Arc<ContextInner<F>>,
}

impl<F: ConnectionFactory> Clone for DatabaseContext<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl DatabaseContext<SqlxFactory> {
    /// Open a context from a URL carrying context options in its query string.
    pub async fn connect(connection_string: &str) -> DbResult<Self> {
        let (driver_url, options) =
            ContextOptions::parse(connection_string).map_err(DbError::configuration)?;
        let factory = SqlxFactory::from_connection_string(&driver_url)?;
        Self::new(factory, options).await
    }
}

impl<F: ConnectionFactory> DatabaseContext<F> {
    /// Build a context. Must be called inside a tokio runtime.
    pub async fn new(factory: F, options: ContextOptions) -> DbResult<Self> {
        Self::with_metrics_sink(factory, options, Arc::new(NoopMetrics)).await
    }

    pub async fn with_metrics_sink(
        factory: F,
        options: ContextOptions,
        sink: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        options.validate().map_err(DbError::configuration)?;

        let requested_mode = options.mode_or_default();
        let target = factory.target();
        let mode = ModeResolver::resolve(requested_mode, target)?;
        let metrics = Arc::new(ConnectionMetrics::new(sink));
        let pool_timeout = options.pool_acquire_timeout();

        let (readers, writers) = if options.governor_enabled() {
            (
                PoolGovernor::new(
                    PoolRole::Reader,
                    options.max_readers_or_default(),
                    pool_timeout,
                )?
                .with_metrics(Arc::clone(&metrics)),
                PoolGovernor::new(
                    PoolRole::Writer,
                    options.max_writers_or_default(mode),
                    pool_timeout,
                )?
                .with_metrics(Arc::clone(&metrics)),
            )
        } else {
            (
                PoolGovernor::unbounded(PoolRole::Reader),
                PoolGovernor::unbounded(PoolRole::Writer),
            )
        };

        let gate = (mode == DbMode::SingleWriter).then(|| {
            WriterGate::new(options.lock_timeout()).with_metrics(Arc::clone(&metrics))
        });

        let id: Arc<str> = format!("ctx_{}", uuid::Uuid::new_v4().simple()).into();
        let inner = Arc::new(ContextInner {
            id,
            read_write_mode: options.read_write_mode_or_default(),
            factory,
            options,
            requested_mode,
            mode,
            readers,
            writers,
            gate,
            pinned: Mutex::new(None),
            pinned_permit: Mutex::new(None),
            sentinel: Mutex::new(None),
            metrics,
            live: Arc::new(AtomicU64::new(0)),
            next_connection_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            runtime: Handle::current(),
            created_at: Utc::now(),
        });
        let context = Self { inner };

        if mode == DbMode::SingleConnection {
            context.open_pinned().await?;
        }
        if ModeResolver::needs_sentinel(mode, context.inner.factory.target()) {
            context.open_sentinel().await?;
        }

        info!(
            context_id = %context.inner.id,
            product = %context.product(),
            requested_mode = %requested_mode,
            mode = %mode,
            read_write_mode = %context.inner.read_write_mode,
            "Database context created"
        );
        Ok(context)
    }

    async fn open_pinned(&self) -> DbResult<()> {
        let permit = self.inner.writers.acquire(&CancellationToken::new()).await?;
        let tracked = self.new_tracked(ConnectionIntent::long_lived(ExecutionType::Write), true)?;
        if let Err(e) = tracked.open().await {
            Self::discard(&tracked).await;
            return Err(e);
        }
        debug!(
            context_id = %self.inner.id,
            connection_id = tracked.id(),
            "Pinned connection opened"
        );
        *lock(&self.inner.pinned) = Some(Arc::new(tracked));
        *lock(&self.inner.pinned_permit) = Some(permit);
        Ok(())
    }

    async fn open_sentinel(&self) -> DbResult<()> {
        let tracked = self.new_tracked(ConnectionIntent::long_lived(ExecutionType::Read), false)?;
        if let Err(e) = tracked.open().await {
            Self::discard(&tracked).await;
            return Err(e);
        }
        debug!(
            context_id = %self.inner.id,
            connection_id = tracked.id(),
            "Sentinel connection opened"
        );
        *lock(&self.inner.sentinel) = Some(Arc::new(tracked));
        Ok(())
    }

    fn new_tracked(
        &self,
        intent: ConnectionIntent,
        shared: bool,
    ) -> DbResult<TrackedConnection<F::Connection>> {
        let conn = self.inner.factory.create_connection(intent)?;
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.inner.live.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.inner.live);
        let mut builder = TrackedConnection::builder(id, conn)
            .metrics(Arc::clone(&self.inner.metrics))
            .on_dispose(Box::new(move || {
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        if shared {
            builder = builder.shared(self.inner.options.lock_timeout());
        }
        if let Some(hook) =
            session_hook(self.product(), self.inner.options.session_sql.clone())
        {
            builder = builder.on_first_open(hook);
        }
        Ok(builder.build())
    }

    async fn discard(tracked: &TrackedConnection<F::Connection>) {
        if let Err(e) = tracked.dispose().await {
            warn!(connection_id = tracked.id(), error = %e, "Failed to dispose connection");
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The resolved, concrete mode.
    pub fn mode(&self) -> DbMode {
        self.inner.mode
    }

    /// The mode as configured, before `best` resolution.
    pub fn requested_mode(&self) -> DbMode {
        self.inner.requested_mode
    }

    pub fn product(&self) -> SupportedDatabase {
        self.inner.factory.product()
    }

    pub fn read_write_mode(&self) -> ReadWriteMode {
        self.inner.read_write_mode
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn assert_is_read_connection(&self) -> DbResult<()> {
        self.assert_allows(ExecutionType::Read)
    }

    pub fn assert_is_write_connection(&self) -> DbResult<()> {
        self.assert_allows(ExecutionType::Write)
    }

    fn assert_allows(&self, execution: ExecutionType) -> DbResult<()> {
        if self.inner.read_write_mode.allows(execution) {
            Ok(())
        } else {
            Err(DbError::ReadWriteViolation {
                requested: execution,
                mode: self.inner.read_write_mode,
            })
        }
    }

    /// Classify a statement as read or write for this context's dialect.
    pub fn execution_type_for(&self, sql: &str) -> DbResult<ExecutionType> {
        classify::execution_type_for(sql, self.product())
    }

    pub async fn get_connection(
        &self,
        execution: ExecutionType,
    ) -> DbResult<ConnectionHandle<F::Connection>> {
        self.get_connection_with_cancel(execution, &CancellationToken::new())
            .await
    }

    pub fn get_connection_blocking(
        &self,
        execution: ExecutionType,
    ) -> DbResult<ConnectionHandle<F::Connection>> {
        blocking::wait(Some(&self.inner.runtime), self.get_connection(execution))
    }

    /// Acquire a connection for `execution`.
    ///
    /// Anything acquired before a failure is released before the error returns.
    pub async fn get_connection_with_cancel(
        &self,
        execution: ExecutionType,
        cancel: &CancellationToken,
    ) -> DbResult<ConnectionHandle<F::Connection>> {
        self.ensure_open()?;
        self.assert_allows(execution)?;

        let started = Instant::now();
        let plan = ConnectionPlan::for_request(self.inner.mode, execution);
        let handle = match plan {
            ConnectionPlan::Pinned => self.lease_pinned(execution, cancel).await?,
            ConnectionPlan::Ephemeral { role } => {
                let permit = self.governor(role).acquire(cancel).await?;
                self.lease_ephemeral(execution, None, permit, cancel).await?
            }
            ConnectionPlan::GatedEphemeral => {
                let gate = self.inner.gate.as_ref().ok_or_else(|| {
                    DbError::internal("single-writer context without a writer gate")
                })?;
                let ticket = gate.enter(cancel).await?;
                let permit = self.inner.writers.acquire(cancel).await?;
                self.lease_ephemeral(execution, Some(ticket), permit, cancel)
                    .await?
            }
        };

        debug!(
            context_id = %self.inner.id,
            connection_id = handle.connection_id(),
            execution = %execution,
            plan = ?plan,
            waited_ms = started.elapsed().as_millis() as u64,
            "Connection acquired"
        );
        Ok(handle)
    }

    async fn lease_pinned(
        &self,
        execution: ExecutionType,
        cancel: &CancellationToken,
    ) -> DbResult<ConnectionHandle<F::Connection>> {
        let tracked = lock(&self.inner.pinned)
            .clone()
            .ok_or(DbError::ContextClosed)?;
        let guard = tracked.get_lock().lock(cancel).await?;
        tracked.open().await?;
        let access = tracked.access().await?;
        Ok(self.handle(execution, access, guard, tracked, false, None, None))
    }

    async fn lease_ephemeral(
        &self,
        execution: ExecutionType,
        ticket: Option<WriterTicket>,
        permit: PoolPermit,
        cancel: &CancellationToken,
    ) -> DbResult<ConnectionHandle<F::Connection>> {
        let tracked = Arc::new(self.new_tracked(ConnectionIntent::ephemeral(execution), false)?);
        let acquired = async {
            tracked.open().await?;
            let guard = tracked.get_lock().lock(cancel).await?;
            let access = tracked.access().await?;
            Ok::<_, DbError>((guard, access))
        }
        .await;

        match acquired {
            Ok((guard, access)) => Ok(self.handle(
                execution,
                access,
                guard,
                tracked,
                true,
                Some(permit),
                ticket,
            )),
            Err(e) => {
                Self::discard(&tracked).await;
                drop(permit);
                drop(ticket);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle(
        &self,
        execution: ExecutionType,
        access: ConnectionAccess<F::Connection>,
        guard: LockGuard,
        tracked: Shared<F::Connection>,
        ephemeral: bool,
        permit: Option<PoolPermit>,
        ticket: Option<WriterTicket>,
    ) -> ConnectionHandle<F::Connection> {
        ConnectionHandle {
            access,
            lease: Some(Lease {
                lock: Some(guard),
                tracked,
                ephemeral,
                permit,
                ticket,
                context_id: Arc::clone(&self.inner.id),
            }),
            execution,
            runtime: self.inner.runtime.clone(),
            acquired_at: Instant::now(),
        }
    }

    fn governor(&self, role: PoolRole) -> &PoolGovernor {
        match role {
            PoolRole::Reader => &self.inner.readers,
            PoolRole::Writer => &self.inner.writers,
        }
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::ContextClosed);
        }
        Ok(())
    }

    /// Release a handle explicitly: unlock, dispose if ephemeral, return permit, leave gate.
    pub async fn close_and_dispose_connection(
        &self,
        handle: ConnectionHandle<F::Connection>,
    ) -> DbResult<()> {
        handle.release().await
    }

    /// Classify `sql`, run it on a suitable connection, and release the connection.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        let execution = self.execution_type_for(sql)?;
        let mut handle = self.get_connection(execution).await?;
        let result = handle.execute(sql).await;
        let released = handle.release().await;
        match (result, released) {
            (Ok(rows), released) => released.map(|()| rows),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!(
                    context_id = %self.inner.id,
                    error = %release_error,
                    "Failed to release connection after statement error"
                );
                Err(e)
            }
        }
    }

    pub fn metrics(&self) -> ContextMetrics {
        let inner = &self.inner;
        ContextMetrics {
            context_id: inner.id.to_string(),
            mode: inner.mode,
            current_open: inner.metrics.current_open(),
            peak_open: inner.metrics.peak_open(),
            total_opened: inner.metrics.total_opened(),
            live_connections: inner.live.load(Ordering::SeqCst),
            lock_timeouts: inner.metrics.lock_timeouts(),
            pool_saturations: inner.metrics.pool_saturations(),
            readers_in_use: inner.readers.in_use(),
            writers_in_use: inner.writers.in_use(),
            waiting_writers: match &inner.gate {
                Some(gate) => gate.waiting_writers(),
                None => inner.writers.waiting(),
            },
        }
    }

    /// Close the context. Later `get_connection` calls fail with `ContextClosed`.
    ///
    /// The pinned connection is drained before it closes, so in-flight users
    /// finish first. Idempotent.
    pub async fn close(&self) -> DbResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(gate) = &self.inner.gate {
            gate.close();
        }
        self.inner.readers.close();
        self.inner.writers.close();

        let pinned = lock(&self.inner.pinned).take();
        if let Some(pinned) = pinned {
            pinned.dispose().await?;
        }
        drop(lock(&self.inner.pinned_permit).take());

        let sentinel = lock(&self.inner.sentinel).take();
        if let Some(sentinel) = sentinel {
            sentinel.dispose().await?;
        }

        info!(
            context_id = %self.inner.id,
            total_opened = self.inner.metrics.total_opened(),
            peak_open = self.inner.metrics.peak_open(),
            "Database context closed"
        );
        Ok(())
    }

    pub fn close_blocking(&self) -> DbResult<()> {
        blocking::wait(Some(&self.inner.runtime), self.close())
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for DatabaseContext<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("id", &self.inner.id)
            .field("product", &self.product())
            .field("mode", &self.inner.mode)
            .field("read_write_mode", &self.inner.read_write_mode)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Session setup run on each physical connection's first open.
fn session_hook<C: ProviderConnection>(
    product: SupportedDatabase,
    extra: Option<String>,
) -> Option<FirstOpenHook<C>> {
    let statements: Vec<String> = product
        .session_settings_sql()
        .map(String::from)
        .into_iter()
        .chain(extra)
        .collect();
    if statements.is_empty() {
        return None;
    }
    Some(first_open_hook(move |conn: &mut C| {
        Box::pin(async move {
            for sql in &statements {
                conn.execute(sql).await?;
            }
            Ok(())
        })
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a handle must give back, in release order.
struct Lease<C: ProviderConnection> {
    lock: Option<LockGuard>,
    tracked: Shared<C>,
    ephemeral: bool,
    permit: Option<PoolPermit>,
    ticket: Option<WriterTicket>,
    context_id: Arc<str>,
}

impl<C: ProviderConnection> Lease<C> {
    async fn release(self) -> DbResult<()> {
        let Lease {
            lock,
            tracked,
            ephemeral,
            permit,
            ticket,
            context_id,
        } = self;
        let connection_id = tracked.id();

        drop(lock);
        let result = if ephemeral {
            tracked.dispose().await
        } else {
            Ok(())
        };
        drop(tracked);
        drop(permit);
        drop(ticket);

        debug!(context_id = %context_id, connection_id, "Connection released");
        result
    }
}

/// A leased connection. Derefs to the provider connection.
///
/// # Usage
///
/// ```ignore
/// let mut conn = context.get_connection(ExecutionType::Write).await?;
/// conn.execute("INSERT INTO t VALUES (1)").await?;
///
/// // Explicit release (preferred) or rely on Drop
/// conn.release().await?;
/// ```
///
/// # Runtime Shutdown Behavior
///
/// `Drop` spawns the release on the context's runtime. If that runtime is
/// shutting down the task may never run; always prefer `release().await`.
pub struct ConnectionHandle<C: ProviderConnection> {
    access: ConnectionAccess<C>,
    lease: Option<Lease<C>>,
    execution: ExecutionType,
    runtime: Handle,
    acquired_at: Instant,
}

impl<C: ProviderConnection> ConnectionHandle<C> {
    pub fn execution(&self) -> ExecutionType {
        self.execution
    }

    pub fn connection_id(&self) -> u64 {
        self.lease
            .as_ref()
            .map(|lease| lease.tracked.id())
            .unwrap_or_default()
    }

    /// True for the shared pinned connection of a single-connection context.
    pub fn is_pinned(&self) -> bool {
        self.lease.as_ref().is_some_and(|lease| !lease.ephemeral)
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Explicitly release the connection (preferred over relying on Drop).
    pub async fn release(mut self) -> DbResult<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        // Dropping the handle first gives up the connection borrow.
        drop(self);
        lease.release().await
    }

    pub fn release_blocking(self) -> DbResult<()> {
        let runtime = self.runtime.clone();
        blocking::wait(Some(&runtime), self.release())
    }
}

impl<C: ProviderConnection> std::ops::Deref for ConnectionHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.access
    }
}

impl<C: ProviderConnection> std::ops::DerefMut for ConnectionHandle<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.access
    }
}

impl<C: ProviderConnection> Drop for ConnectionHandle<C> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        self.runtime.spawn(async move {
            let context_id = Arc::clone(&lease.context_id);
            let connection_id = lease.tracked.id();
            if let Err(e) = lease.release().await {
                warn!(
                    context_id = %context_id,
                    connection_id,
                    error = %e,
                    "Release via Drop failed"
                );
            }
            warn!(
                context_id = %context_id,
                connection_id,
                held_ms,
                "Connection released via Drop - consider using explicit release()"
            );
        });
    }
}

impl<C: ProviderConnection> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id())
            .field("execution", &self.execution)
            .field("pinned", &self.is_pinned())
            .field("released", &self.lease.is_none())
            .finish_non_exhaustive()
    }
}
