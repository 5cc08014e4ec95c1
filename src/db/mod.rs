//! Connection lifecycle and concurrency control.
//!
//! This module provides:
//! - Tracked connections with first-open and dispose hooks
//! - Lockers guarding shared connections
//! - Mode resolution and per-request connection plans
//! - Reader and writer pool governors
//! - The single-writer gate
//! - The per-database context that ties them together
//! - A sqlx provider for PostgreSQL, MySQL and SQLite

pub mod blocking;
pub mod classify;
pub mod context;
pub mod governor;
pub mod locker;
#[macro_use]
pub mod macros;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod sqlx_provider;
pub mod strategy;
pub mod tracked;
pub mod writer_gate;

pub use context::{ConnectionHandle, DatabaseContext};
pub use governor::{PoolGovernor, PoolPermit};
pub use locker::{AsyncLocker, LockCore, LockGuard, Locker, NOOP_LOCKER, NoOpLocker};
pub use metrics::{ConnectionMetrics, MetricsSink, NoopMetrics, TracingMetrics};
pub use provider::{
    ConnectionFactory, ConnectionIntent, DisposeHook, FirstOpenHook, ProviderConnection,
    first_open_hook,
};
pub use registry::{ContextRegistry, ContextSummary};
pub use sqlx_provider::{DbConnection, SqlxConnection, SqlxFactory};
pub use strategy::{ConnectionPlan, ModeResolver};
pub use tracked::{ConnectionAccess, TrackedConnection};
pub use writer_gate::{WriterGate, WriterTicket};
