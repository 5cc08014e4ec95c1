//! Single-writer gate.
//!
//! At most one writer is inside the gate at a time. Waiting writers are
//! admitted in arrival order. Readers never touch the gate.

use crate::db::blocking;
use crate::db::locker::{LockCore, LockGuard};
use crate::db::metrics::ConnectionMetrics;
use crate::error::DbResult;
use crate::models::LockScope;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct WriterGate {
    core: LockCore,
}

impl WriterGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            core: LockCore::new(LockScope::WriterGate, 0, timeout),
        }
    }

    pub fn with_metrics(self, metrics: Arc<ConnectionMetrics>) -> Self {
        Self {
            core: self.core.with_metrics(metrics),
        }
    }

    /// Wait for the gate, failing with `LockTimeout` after the gate timeout.
    pub async fn enter(&self, cancel: &CancellationToken) -> DbResult<WriterTicket> {
        let guard = self.core.lock(cancel).await?;
        Ok(WriterTicket { _guard: guard })
    }

    pub fn enter_blocking(&self, cancel: &CancellationToken) -> DbResult<WriterTicket> {
        blocking::wait(self.core.runtime(), self.enter(cancel))
    }

    /// 1 while a writer holds the gate, else 0.
    pub fn active_writers(&self) -> usize {
        usize::from(self.core.is_locked())
    }

    pub fn waiting_writers(&self) -> usize {
        self.core.waiters()
    }

    pub(crate) fn close(&self) {
        self.core.close();
    }
}

/// A writer's pass through the gate. Dropping it lets the next writer in.
#[must_use = "the gate reopens as soon as the ticket is dropped"]
#[derive(Debug)]
pub struct WriterTicket {
    _guard: LockGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_one_writer_at_a_time() {
        let gate = Arc::new(WriterGate::new(Duration::from_secs(5)));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _ticket = gate.enter(&CancellationToken::new()).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(gate.active_writers(), 0);
    }

    #[tokio::test]
    async fn test_writers_admitted_in_arrival_order() {
        let gate = Arc::new(WriterGate::new(Duration::from_secs(5)));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = gate.enter(&CancellationToken::new()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _ticket = gate.enter(&CancellationToken::new()).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each writer queue before the next arrives.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(gate.waiting_writers(), 4);
        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_gate_timeout_is_lock_timeout() {
        let gate = WriterGate::new(Duration::from_millis(20));
        let _ticket = gate.enter(&CancellationToken::new()).await.unwrap();
        assert_eq!(gate.active_writers(), 1);

        let err = gate.enter(&CancellationToken::new()).await.unwrap_err();
        let snapshot = err.contention().unwrap();
        assert_eq!(snapshot.scope, LockScope::WriterGate);
    }

    #[tokio::test]
    async fn test_closed_gate_reports_context_closed() {
        let gate = WriterGate::new(Duration::from_millis(20));
        gate.close();
        let err = gate.enter(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DbError::ContextClosed));
    }
}
