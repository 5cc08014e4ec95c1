//! Database context library.
//!
//! Connection lifecycle and concurrency control for relational databases:
//! mode resolution, pinned and ephemeral connections, reader/writer pool
//! governors and a single-writer gate, behind one `DatabaseContext` per database.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, ContextOptions};
pub use db::{ConnectionHandle, DatabaseContext};
pub use error::{DbError, DbResult};
