//! Provider boundary.
//!
//! The core never talks to a driver directly. A [`ConnectionFactory`] hands out
//! unopened [`ProviderConnection`]s and the core decides when they open, who
//! may use them, and when they close.

use crate::error::DbResult;
use crate::models::{ConnectionTarget, ExecutionType, SupportedDatabase};
use futures_util::future::BoxFuture;
use std::future::Future;

/// A single physical connection owned by the provider.
pub trait ProviderConnection: Send + 'static {
    /// Establish the physical connection. Called at most once per open transition.
    fn open(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the physical connection.
    fn close(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str) -> impl Future<Output = DbResult<u64>> + Send;

    fn is_open(&self) -> bool;
}

/// What a requested connection will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIntent {
    pub execution: ExecutionType,
    /// The connection will be pinned or held as a sentinel for the context lifetime.
    pub long_lived: bool,
}

impl ConnectionIntent {
    pub fn ephemeral(execution: ExecutionType) -> Self {
        Self {
            execution,
            long_lived: false,
        }
    }

    pub fn long_lived(execution: ExecutionType) -> Self {
        Self {
            execution,
            long_lived: true,
        }
    }
}

/// Creates physical connections for one connection target.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: ProviderConnection;

    fn product(&self) -> SupportedDatabase;

    fn target(&self) -> &ConnectionTarget;

    /// Create an unopened connection.
    fn create_connection(&self, intent: ConnectionIntent) -> DbResult<Self::Connection>;
}

/// Async hook run once, on the first successful open of a connection.
pub type FirstOpenHook<C> =
    Box<dyn for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, DbResult<()>> + Send + 'static>;

/// Sync hook run once when a connection is disposed or dropped.
pub type DisposeHook = Box<dyn FnOnce() + Send + 'static>;

/// Box a first-open closure.
///
/// ```ignore
/// let hook = first_open_hook(|conn: &mut SqlxConnection| {
///     Box::pin(async move { conn.execute("PRAGMA foreign_keys = ON").await.map(|_| ()) })
/// });
/// ```
pub fn first_open_hook<C, F>(f: F) -> FirstOpenHook<C>
where
    C: ProviderConnection,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, DbResult<()>> + Send + 'static,
{
    Box::new(f)
}
