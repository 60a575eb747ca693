//! Mock database pools for testing.
//!
//! Provides an in-memory `PoolConnector` so the pool manager, the executor and
//! the HTTP layer can be exercised without a running server.
//!
//! Statement behavior is driven by the SQL text:
//! - anything containing `FAIL` raises a syntax error (SQLSTATE 42601);
//! - `pg_sleep(n)` sleeps for `n` seconds on the tokio clock;
//! - `SELECT` / `WITH` return one row, everything else affects one row.

use super::{
    command_tag, ColumnInfo, ConnectionCounts, DatabasePool, DatabaseSession, PoolConnector,
    QueryResult, Value,
};
use crate::config::PoolSettings;
use crate::error::{ConsoleError, DatabaseErrorInfo, Result};
use crate::pool::PoolKey;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Host name that makes every statement fail with a connection error.
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

type Journal = Arc<Mutex<Vec<String>>>;

fn lock(journal: &Journal) -> MutexGuard<'_, Vec<String>> {
    journal.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates `MockPool`s and remembers every one of them.
#[derive(Default)]
pub struct MockConnector {
    pools: Mutex<Vec<Arc<MockPool>>>,
    journal: Journal,
    fail_rollback: bool,
}

impl MockConnector {
    /// Creates a new mock connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector whose pools fail every ROLLBACK.
    pub fn with_failing_rollback() -> Self {
        Self {
            fail_rollback: true,
            ..Self::default()
        }
    }

    /// Number of pools created so far.
    pub fn pools_created(&self) -> usize {
        self.pools().len()
    }

    /// Every pool created so far, in creation order.
    pub fn pools(&self) -> Vec<Arc<MockPool>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Statements executed across all pools, in execution order.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }
}

impl PoolConnector for MockConnector {
    fn create_pool(&self, key: &PoolKey, _settings: &PoolSettings) -> Result<Arc<dyn DatabasePool>> {
        let pool = Arc::new(MockPool {
            key: key.clone(),
            closed: AtomicBool::new(false),
            checked_out: Arc::new(AtomicUsize::new(0)),
            journal: Arc::clone(&self.journal),
            fail_rollback: self.fail_rollback,
        });
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&pool));
        Ok(pool)
    }
}

/// An in-memory pool.
pub struct MockPool {
    key: PoolKey,
    closed: AtomicBool,
    checked_out: Arc<AtomicUsize>,
    journal: Journal,
    fail_rollback: bool,
}

impl MockPool {
    /// The credential set this pool was created for.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently checked out.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConsoleError::connection(format!(
                "Pool for {} has been closed",
                self.key
            )));
        }
        if self.key.host == UNREACHABLE_HOST {
            return Err(ConsoleError::connection(format!(
                "Cannot connect to {}:{}. Check that the server is running.",
                self.key.host, self.key.port
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabasePool for MockPool {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        self.ensure_usable()?;
        run_mock_statement(&self.journal, sql).await
    }

    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>> {
        self.ensure_usable()?;
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            checked_out: Arc::clone(&self.checked_out),
            journal: Arc::clone(&self.journal),
            fail_rollback: self.fail_rollback,
        }))
    }

    fn connection_counts(&self) -> ConnectionCounts {
        let busy = self.checked_out() as u32;
        ConnectionCounts {
            total: busy.max(1),
            idle: if busy == 0 { 1 } else { 0 },
            waiting: 0,
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A session checked out of a `MockPool`.
struct MockSession {
    checked_out: Arc<AtomicUsize>,
    journal: Journal,
    fail_rollback: bool,
}

#[async_trait]
impl DatabaseSession for MockSession {
    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        run_mock_statement(&self.journal, sql).await
    }

    async fn begin(&mut self) -> Result<()> {
        lock(&self.journal).push("BEGIN".to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        lock(&self.journal).push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        lock(&self.journal).push("ROLLBACK".to_string());
        if self.fail_rollback {
            return Err(ConsoleError::connection("connection reset by peer"));
        }
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_mock_statement(journal: &Journal, sql: &str) -> Result<QueryResult> {
    lock(journal).push(sql.to_string());

    let upper = sql.to_uppercase();

    // Negative or non-finite durations return immediately, as on a real server
    let sleep = sleep_seconds(&upper).and_then(|s| Duration::try_from_secs_f64(s).ok());
    if let Some(duration) = sleep {
        tokio::time::sleep(duration).await;
    }

    if let Some(offset) = upper.find("FAIL") {
        return Err(ConsoleError::Query(DatabaseErrorInfo {
            message: "syntax error at or near \"FAIL\"".to_string(),
            code: Some("42601".to_string()),
            severity: Some("ERROR".to_string()),
            routine: Some("scanner_yyerror".to_string()),
            position: Some(offset + 1),
            ..Default::default()
        }));
    }

    let command = command_tag(sql);
    if matches!(command.as_str(), "SELECT" | "WITH") {
        Ok(QueryResult::with_data(
            command,
            vec![ColumnInfo::new("result", "TEXT")],
            vec![vec![Value::Text(sql.to_string())]],
        ))
    } else {
        Ok(QueryResult::affected(command, 1))
    }
}

/// Extracts `n` from the first `PG_SLEEP(n)` call in upper-cased SQL.
fn sleep_seconds(upper: &str) -> Option<f64> {
    let start = upper.find("PG_SLEEP(")? + "PG_SLEEP(".len();
    let end = upper[start..].find(')')? + start;
    upper[start..end].trim().parse().ok()
}
