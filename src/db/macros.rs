//! Driver dispatch macros.
//!
//! Generates the per-driver match over [`DbConnection`](crate::db::sqlx_provider::DbConnection)
//! so each operation reads as one arm per backend.

/// Macro for generating driver dispatch match arms over `DbConnection`.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(conn, {
///     MySql(c) => sqlx::raw_sql(sql).execute(c).await?.rows_affected(),
///     Postgres(c) => sqlx::raw_sql(sql).execute(c).await?.rows_affected(),
///     SQLite(c) => sqlx::raw_sql(sql).execute(c).await?.rows_affected(),
/// });
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::sqlx_provider::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;
