//! Query execution with strategy selection.
//!
//! Classifies a batch and runs it directly, concurrently, inside a
//! transaction or sequentially, always producing a response envelope.

use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::request::ExecuteRequest;
use super::response::{BatchResult, ErrorEnvelope, ExecuteResponse, StatementResult};
use crate::classifier::{optimize_query, parse_query, ExecutionStrategy, ParsedStatement};
use crate::db::truncate_statement;
use crate::error::ConsoleError;
use crate::pool::{PoolKey, PoolManager, PoolStats};

/// Longest statement preview included in a transaction failure message.
const FAILED_STATEMENT_PREVIEW: usize = 100;

/// Executes SQL batches against the pool manager.
#[derive(Clone)]
pub struct QueryExecutor {
    pools: Arc<PoolManager>,
}

impl QueryExecutor {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    /// The pool manager this executor runs on.
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Snapshot of every cached pool.
    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.pool_stats().await
    }

    /// Validates a request and executes its SQL.
    pub async fn handle(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let start = Instant::now();
        match request.validate() {
            Ok((key, sql)) => self.execute(&key, sql).await,
            Err(e) => {
                debug!(error = %e, "Rejected request");
                ExecuteResponse::failure(&e, start.elapsed())
            }
        }
    }

    /// Executes raw SQL text, possibly holding several statements.
    ///
    /// Statements that fail are reported in the response; nothing is retried.
    pub async fn execute(&self, key: &PoolKey, sql: &str) -> ExecuteResponse {
        let start = Instant::now();

        let statements = match parse_query(sql) {
            Ok(statements) => statements,
            Err(e) => return ExecuteResponse::failure(&e, start.elapsed()),
        };

        let strategy = ExecutionStrategy::for_batch(&statements);
        debug!(pool = %key, %strategy, statements = statements.len(), "Executing batch");

        let response = match strategy {
            ExecutionStrategy::Direct => self.execute_single(key, &statements[0], start).await,
            ExecutionStrategy::Concurrent => {
                self.execute_concurrent(key, &statements, start).await
            }
            ExecutionStrategy::Transaction => {
                self.execute_transaction(key, &statements, start).await
            }
            ExecutionStrategy::Sequential => {
                self.execute_sequential(key, &statements, start).await
            }
        };

        if let ExecuteResponse::Batch(batch) = &response {
            info!(
                %strategy,
                succeeded = batch.succeeded(),
                total = batch.results.len(),
                elapsed_ms = batch.total_execution_time,
                "Batch completed"
            );
        }
        response
    }

    /// Runs a lone statement through `optimize_query`, writes included.
    async fn execute_single(
        &self,
        key: &PoolKey,
        statement: &ParsedStatement,
        start: Instant,
    ) -> ExecuteResponse {
        let sql = optimize_query(&statement.sql);

        match self.pools.query(key, &sql, &[]).await {
            Ok(result) => ExecuteResponse::Single(StatementResult::success(
                statement.sql.clone(),
                result,
                start.elapsed(),
            )),
            Err(e) => ExecuteResponse::Failure(ErrorEnvelope::from_error(
                &e,
                start.elapsed(),
                Some(statement.sql.clone()),
            )),
        }
    }

    /// Runs every statement in parallel, each on its own pooled connection.
    async fn execute_concurrent(
        &self,
        key: &PoolKey,
        statements: &[ParsedStatement],
        start: Instant,
    ) -> ExecuteResponse {
        let runs = statements.iter().map(|statement| self.run_one(key, statement));
        let results = join_all(runs).await;
        ExecuteResponse::Batch(BatchResult::new(results, start.elapsed(), false))
    }

    /// Runs statements one after another, continuing past failures.
    async fn execute_sequential(
        &self,
        key: &PoolKey,
        statements: &[ParsedStatement],
        start: Instant,
    ) -> ExecuteResponse {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.run_one(key, statement).await);
        }
        ExecuteResponse::Batch(BatchResult::new(results, start.elapsed(), false))
    }

    /// Runs all statements on one session between BEGIN and COMMIT.
    ///
    /// The first failure rolls the transaction back and aborts the batch.
    async fn execute_transaction(
        &self,
        key: &PoolKey,
        statements: &[ParsedStatement],
        start: Instant,
    ) -> ExecuteResponse {
        let batch: Vec<(String, String)> = statements
            .iter()
            .map(|statement| (statement.sql.clone(), executable_sql(statement)))
            .collect();

        let outcome = self
            .pools
            .query_with_client(key, move |session| {
                async move {
                    session.begin().await?;

                    let mut results = Vec::with_capacity(batch.len());
                    for (statement, sql) in &batch {
                        let started = Instant::now();
                        match session.execute(sql, &[]).await {
                            Ok(result) => results.push(StatementResult::success(
                                statement.clone(),
                                result,
                                started.elapsed(),
                            )),
                            Err(e) => {
                                let rollback_error = match session.rollback().await {
                                    Ok(()) => None,
                                    Err(rollback) => {
                                        warn!(error = %rollback, "Rollback failed");
                                        Some(rollback.to_string())
                                    }
                                };
                                return Err(ConsoleError::TransactionAborted {
                                    statement: truncate_statement(
                                        statement,
                                        FAILED_STATEMENT_PREVIEW,
                                    ),
                                    cause: e.to_error_info(),
                                    rollback_error,
                                });
                            }
                        }
                    }

                    session.commit().await?;
                    Ok(results)
                }
                .boxed()
            })
            .await;

        match outcome {
            Ok(results) => {
                ExecuteResponse::Batch(BatchResult::new(results, start.elapsed(), true))
            }
            Err(e) => {
                warn!(pool = %key, error = %e, "Transaction aborted");
                ExecuteResponse::Failure(
                    ErrorEnvelope::from_error(&e, start.elapsed(), None).with_transaction(),
                )
            }
        }
    }

    /// Executes one statement of a batch, timed from its own dispatch.
    async fn run_one(&self, key: &PoolKey, statement: &ParsedStatement) -> StatementResult {
        let started = Instant::now();
        let sql = executable_sql(statement);

        match self.pools.query(key, &sql, &[]).await {
            Ok(result) => StatementResult::success(statement.sql.clone(), result, started.elapsed()),
            Err(e) => StatementResult::failure(statement.sql.clone(), &e, started.elapsed()),
        }
    }
}

/// Batch statements get the row limit only when read-only; writes run as parsed.
fn executable_sql(statement: &ParsedStatement) -> String {
    if statement.is_read_only {
        optimize_query(&statement.sql)
    } else {
        statement.sql.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::db::{MockConnector, UNREACHABLE_HOST};
    use crate::query::response::ResponseStatus;
    use crate::query::Credentials;
    use pretty_assertions::assert_eq;

    fn key() -> PoolKey {
        PoolKey {
            host: "localhost".to_string(),
            port: 5432,
            database: "app".to_string(),
            user: "admin".to_string(),
            password: "secret".to_string(),
            ssl: false,
        }
    }

    fn executor_with(connector: MockConnector) -> (QueryExecutor, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let pools = PoolManager::with_connector(connector.clone(), PoolSettings::default());
        (QueryExecutor::new(Arc::new(pools)), connector)
    }

    fn executor() -> (QueryExecutor, Arc<MockConnector>) {
        executor_with(MockConnector::new())
    }

    fn batch(response: ExecuteResponse) -> BatchResult {
        match response {
            ExecuteResponse::Batch(batch) => batch,
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_statement_is_optimized() {
        let (executor, connector) = executor();

        let response = executor.execute(&key(), "SELECT * FROM users").await;

        assert_eq!(response.status(), ResponseStatus::Ok);
        let ExecuteResponse::Single(result) = response else {
            panic!("expected single result");
        };
        assert_eq!(result.statement, "SELECT * FROM users");
        assert_eq!(result.command.as_deref(), Some("SELECT"));
        assert_eq!(connector.journal(), vec!["SELECT * FROM users LIMIT 1000"]);
    }

    #[tokio::test]
    async fn test_whitespace_collapse_only_on_single_statements() {
        // A lone write is collapsed, literals included
        let (single, connector) = executor();
        single.execute(&key(), "INSERT INTO t VALUES ('a  b')").await;
        assert_eq!(connector.journal(), vec!["INSERT INTO t VALUES ('a b')"]);

        // Inside a batch, writes run as parsed
        let (batch, connector) = executor();
        batch
            .execute(&key(), "INSERT INTO t VALUES ('a  b'); SELECT 1")
            .await;
        assert_eq!(
            connector.journal(),
            vec!["INSERT INTO t VALUES ('a  b')", "SELECT 1 LIMIT 1000"]
        );
    }

    #[tokio::test]
    async fn test_single_statement_failure() {
        let (executor, _) = executor();

        let response = executor.execute(&key(), "SELECT FAIL").await;

        assert_eq!(response.status(), ResponseStatus::ServerError);
        let ExecuteResponse::Failure(envelope) = response else {
            panic!("expected failure");
        };
        assert_eq!(envelope.code.as_deref(), Some("42601"));
        assert_eq!(envelope.statement.as_deref(), Some("SELECT FAIL"));
    }

    #[tokio::test]
    async fn test_concurrent_reads() {
        let (executor, connector) = executor();

        let response = executor.execute(&key(), "SELECT 1; SELECT 2;").await;
        assert_eq!(response.status(), ResponseStatus::Ok);

        let batch = batch(response);
        assert!(batch.multiple_results);
        assert_eq!(batch.transaction_used, None);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0].statement, "SELECT 1");
        assert_eq!(batch.results[1].statement, "SELECT 2");
        assert_eq!(connector.pools_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_statements_are_timed_independently() {
        let (executor, _) = executor();

        let response = executor
            .execute(&key(), "SELECT pg_sleep(2); SELECT 1")
            .await;

        let batch = batch(response);
        assert!(batch.results[0].execution_time >= 2000);
        assert!(batch.results[1].execution_time < 2000);
        assert!(batch.total_execution_time >= 2000);
        assert!(batch.total_execution_time < 4000);
    }

    #[tokio::test]
    async fn test_concurrent_partial_failure() {
        let (executor, _) = executor();

        let response = executor.execute(&key(), "SELECT 1; SELECT FAIL; SELECT 3").await;
        assert_eq!(response.status(), ResponseStatus::ServerError);

        let batch = batch(response);
        assert!(batch.error);
        assert_eq!(batch.succeeded(), 2);
        assert!(batch.results[1].is_error());
    }

    #[tokio::test]
    async fn test_transaction_commits_writes() {
        let (executor, connector) = executor();

        let response = executor
            .execute(&key(), "INSERT INTO t VALUES (1); UPDATE t SET x=2;")
            .await;
        assert_eq!(response.status(), ResponseStatus::Ok);

        let batch = batch(response);
        assert_eq!(batch.transaction_used, Some(true));
        assert_eq!(batch.results.len(), 2);
        assert_eq!(
            connector.journal(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "UPDATE t SET x=2", "COMMIT"]
        );
        assert_eq!(connector.pools()[0].checked_out(), 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_failure() {
        let (executor, connector) = executor();

        let response = executor
            .execute(
                &key(),
                "INSERT INTO t VALUES (1); UPDATE FAIL SET x=2; DELETE FROM t",
            )
            .await;
        assert_eq!(response.status(), ResponseStatus::ServerError);

        let ExecuteResponse::Failure(envelope) = response else {
            panic!("expected failure");
        };
        assert_eq!(envelope.transaction_used, Some(true));
        assert_eq!(envelope.statement.as_deref(), Some("UPDATE FAIL SET x=2"));
        assert!(envelope
            .error
            .starts_with("Transaction failed at statement: UPDATE FAIL SET x=2. Error:"));
        assert_eq!(envelope.code.as_deref(), Some("42601"));

        // Remaining statements never run
        assert_eq!(
            connector.journal(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "UPDATE FAIL SET x=2", "ROLLBACK"]
        );
        assert_eq!(connector.pools()[0].checked_out(), 0);
    }

    #[tokio::test]
    async fn test_transaction_failure_truncates_statement() {
        let (executor, _) = executor();
        let long_update = format!("UPDATE t SET note = '{}' WHERE FAIL", "x".repeat(200));
        let sql = format!("INSERT INTO t VALUES (1); {long_update}");

        let ExecuteResponse::Failure(envelope) = executor.execute(&key(), &sql).await else {
            panic!("expected failure");
        };
        let statement = envelope.statement.unwrap();
        assert_eq!(statement.chars().count(), FAILED_STATEMENT_PREVIEW + 3);
        assert!(statement.ends_with("..."));
    }

    #[tokio::test]
    async fn test_rollback_failure_is_reported() {
        let (executor, _) = executor_with(MockConnector::with_failing_rollback());

        let ExecuteResponse::Failure(envelope) = executor
            .execute(&key(), "INSERT INTO t VALUES (1); UPDATE FAIL")
            .await
        else {
            panic!("expected failure");
        };
        assert!(envelope.error.contains("rollback failed"));
    }

    #[tokio::test]
    async fn test_sequential_mixed_batch_continues_past_failure() {
        let (executor, connector) = executor();

        let response = executor
            .execute(&key(), "SELECT FAIL; UPDATE t SET x = 1; SELECT * FROM t")
            .await;

        let batch = batch(response);
        assert_eq!(batch.transaction_used, None);
        assert!(batch.error);
        assert_eq!(batch.succeeded(), 2);
        assert_eq!(
            connector.journal(),
            vec![
                "SELECT FAIL LIMIT 1000",
                "UPDATE t SET x = 1",
                "SELECT * FROM t LIMIT 1000"
            ]
        );
    }

    #[tokio::test]
    async fn test_blank_sql_touches_no_pool() {
        let (executor, connector) = executor();

        let response = executor.execute(&key(), "  ;  -- nothing\n").await;

        assert_eq!(response.status(), ResponseStatus::ClientError);
        let ExecuteResponse::Failure(envelope) = response else {
            panic!("expected failure");
        };
        assert_eq!(envelope.error, "No valid SQL statements found");
        assert_eq!(connector.pools_created(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_client_error() {
        let (executor, connector) = executor();

        let request = ExecuteRequest::new(
            Credentials {
                host: Some("localhost".to_string()),
                ..Default::default()
            },
            "SELECT 1",
        );
        let response = executor.handle(&request).await;

        assert_eq!(response.status(), ResponseStatus::ClientError);
        assert_eq!(connector.pools_created(), 0);
    }

    #[tokio::test]
    async fn test_connection_failure_is_server_error() {
        let (executor, _) = executor();
        let unreachable = PoolKey {
            host: UNREACHABLE_HOST.to_string(),
            ..key()
        };

        let response = executor.execute(&unreachable, "SELECT 1").await;

        assert_eq!(response.status(), ResponseStatus::ServerError);
        let ExecuteResponse::Failure(envelope) = response else {
            panic!("expected failure");
        };
        assert!(envelope.error.contains("Cannot connect"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_statement_completes_normally() {
        let (executor, connector) = executor();

        let response = executor.execute(&key(), "SELECT pg_sleep(1.5)").await;

        assert_eq!(response.status(), ResponseStatus::Ok);
        let ExecuteResponse::Single(result) = response else {
            panic!("expected single result");
        };
        assert!(result.execution_time >= 1500);
        assert_eq!(connector.journal(), vec!["SELECT pg_sleep(1.5) LIMIT 1000"]);
        assert_eq!(
            executor.pool_stats().await[0].in_use,
            0,
            "lease released after slow query"
        );
    }
}
