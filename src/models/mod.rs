//! Data models shared across the connection core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod database;
pub mod mode;
pub mod snapshot;

// Re-export commonly used types
pub use database::{ConnectionTarget, ConnectionTargetError, MemoryKind, SupportedDatabase};
pub use mode::{DbMode, ExecutionType, ReadWriteMode};
pub use snapshot::{ContentionSnapshot, ContextMetrics, LockScope, PoolRole, SaturationSnapshot};
