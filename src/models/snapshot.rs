//! Diagnostic snapshots carried by contention errors and metrics reports.

use crate::models::DbMode;
use serde::Serialize;
use std::time::Duration;

/// Which lock a contention snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// The lock guarding a pinned, shared connection.
    SharedConnection,
    /// The single-writer gate.
    WriterGate,
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedConnection => write!(f, "shared connection lock"),
            Self::WriterGate => write!(f, "writer gate"),
        }
    }
}

/// Point-in-time view of a lock when an acquisition timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentionSnapshot {
    pub scope: LockScope,
    /// Callers queued on the lock, including the one that timed out.
    pub waiters: usize,
    #[serde(rename = "waited_ms", serialize_with = "as_millis")]
    pub waited: Duration,
    #[serde(rename = "timeout_ms", serialize_with = "as_millis")]
    pub timeout: Duration,
    pub total_acquisitions: u64,
    pub total_timeouts: u64,
}

impl std::fmt::Display for ContentionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} not acquired after {}ms (timeout {}ms, {} waiting, {} acquisitions, {} timeouts)",
            self.scope,
            self.waited.as_millis(),
            self.timeout.as_millis(),
            self.waiters,
            self.total_acquisitions,
            self.total_timeouts
        )
    }
}

/// Which pool a governor bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    Reader,
    Writer,
}

impl std::fmt::Display for PoolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reader => write!(f, "reader"),
            Self::Writer => write!(f, "writer"),
        }
    }
}

/// Point-in-time view of a governor when a permit acquisition timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaturationSnapshot {
    pub role: PoolRole,
    pub capacity: usize,
    /// Permits currently held.
    pub in_use: usize,
    /// Callers queued for a permit, including the one that timed out.
    pub waiting: usize,
    #[serde(rename = "timeout_ms", serialize_with = "as_millis")]
    pub timeout: Duration,
}

impl std::fmt::Display for SaturationSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pool saturated: {}/{} permits in use, {} waiting, timeout {}ms",
            self.role,
            self.in_use,
            self.capacity,
            self.waiting,
            self.timeout.as_millis()
        )
    }
}

/// Live counters reported by a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMetrics {
    pub context_id: String,
    pub mode: DbMode,
    pub current_open: u64,
    pub peak_open: u64,
    pub total_opened: u64,
    /// Tracked connections created and not yet disposed.
    pub live_connections: u64,
    pub lock_timeouts: u64,
    pub pool_saturations: u64,
    pub readers_in_use: usize,
    pub writers_in_use: usize,
    pub waiting_writers: usize,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
