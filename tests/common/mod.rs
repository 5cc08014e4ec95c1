//! Scriptable in-process provider shared by the integration tests.

#![allow(dead_code)]

use db_context::config::ContextOptions;
use db_context::db::{ConnectionFactory, ConnectionIntent, DatabaseContext, ProviderConnection};
use db_context::error::{DbError, DbResult};
use db_context::models::{ConnectionTarget, SupportedDatabase};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counters and knobs shared by every connection a `MockFactory` creates.
#[derive(Debug, Default)]
pub struct MockState {
    pub created: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    /// Opens that will fail before opens start succeeding again.
    pub fail_opens: AtomicUsize,
    /// Statements containing this text fail instead of running.
    pub failing_statement: Mutex<Option<String>>,
    /// Delay applied to every `execute`, in milliseconds.
    pub execute_delay_ms: AtomicU64,
    pub active_executes: AtomicUsize,
    pub peak_active_executes: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
}

impl MockState {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active_executes.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_statements_containing(&self, text: &str) {
        *self.failing_statement.lock().unwrap() = Some(text.to_string());
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.execute_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
    pub intent: ConnectionIntent,
    open: bool,
}

impl ProviderConnection for MockConnection {
    async fn open(&mut self) -> DbResult<()> {
        let scripted_failure = self
            .state
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(DbError::provider("scripted open failure"));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        if !self.open {
            return Err(DbError::provider("connection is not open"));
        }
        let scripted_failure = self
            .state
            .failing_statement
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|text| sql.contains(text));
        if scripted_failure {
            return Err(DbError::provider("scripted execute failure"));
        }
        self.state.executed.lock().unwrap().push(sql.to_string());

        let active = self.state.active_executes.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .peak_active_executes
            .fetch_max(active, Ordering::SeqCst);
        let delay = self.state.execute_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.active_executes.fetch_sub(1, Ordering::SeqCst);
        Ok(1)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Debug)]
pub struct MockFactory {
    target: ConnectionTarget,
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(connection_string: &str) -> Self {
        Self {
            target: ConnectionTarget::parse(connection_string).unwrap(),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn product(&self) -> SupportedDatabase {
        self.target.product
    }

    fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    fn create_connection(&self, intent: ConnectionIntent) -> DbResult<MockConnection> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: Arc::clone(&self.state),
            intent,
            open: false,
        })
    }
}

/// Build a context over a mock target, returning the shared mock state.
pub async fn mock_context(
    connection_string: &str,
    options: ContextOptions,
) -> (DatabaseContext<MockFactory>, Arc<MockState>) {
    let factory = MockFactory::new(connection_string);
    let state = factory.state();
    let context = DatabaseContext::new(factory, options).await.unwrap();
    (context, state)
}

/// Statements executed excluding the per-connection session setup.
pub fn user_statements(state: &MockState) -> Vec<String> {
    state
        .executed()
        .into_iter()
        .filter(|sql| !sql.starts_with("SET ") && !sql.starts_with("PRAGMA "))
        .collect()
}
