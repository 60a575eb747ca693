//! Query executor integration tests.
//!
//! Tests each execution strategy end to end against a real server.

use std::sync::Arc;

use pg_console::config::PoolSettings;
use pg_console::db::Value;
use pg_console::pool::{PoolKey, PoolManager};
use pg_console::query::{ExecuteResponse, QueryExecutor, ResponseStatus};

use super::{get_test_key, unique_table};

fn executor() -> QueryExecutor {
    QueryExecutor::new(Arc::new(PoolManager::new(PoolSettings::default())))
}

async fn create_table(executor: &QueryExecutor, key: &PoolKey, table: &str) {
    let response = executor
        .execute(key, &format!("CREATE TABLE {table} (id int PRIMARY KEY, name text)"))
        .await;
    assert!(response.is_success(), "create failed: {response:?}");
}

async fn drop_table(executor: &QueryExecutor, key: &PoolKey, table: &str) {
    executor.execute(key, &format!("DROP TABLE IF EXISTS {table}")).await;
    executor.pools().close_all_pools().await;
}

async fn count_rows(executor: &QueryExecutor, key: &PoolKey, table: &str) -> Value {
    match executor.execute(key, &format!("SELECT count(*) FROM {table}")).await {
        ExecuteResponse::Single(result) => result.rows[0][0].clone(),
        other => panic!("Expected single result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_single_select() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();

    let response = executor.execute(&key, "SELECT 1 AS num, 'hello' AS greeting").await;
    let ExecuteResponse::Single(result) = response else {
        panic!("Expected single result, got {:?}", response);
    };

    assert_eq!(result.fields.len(), 2);
    assert_eq!(result.fields[1].name, "greeting");
    assert_eq!(result.row_count, 1);
    assert_eq!(result.command.as_deref(), Some("SELECT"));

    executor.pools().close_all_pools().await;
}

#[tokio::test]
async fn test_concurrent_reads() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();

    let response = executor
        .execute(&key, "SELECT 1 AS a; SELECT 2 AS b; SELECT 3 AS c")
        .await;
    let ExecuteResponse::Batch(batch) = response else {
        panic!("Expected batch, got {:?}", response);
    };

    assert!(!batch.error);
    assert_eq!(batch.transaction_used, None);
    let values: Vec<Value> = batch.results.iter().map(|r| r.rows[0][0].clone()).collect();
    assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(batch.results[2].statement, "SELECT 3 AS c");

    executor.pools().close_all_pools().await;
}

#[tokio::test]
async fn test_transaction_commits() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();
    let table = unique_table("pgc_commit");
    create_table(&executor, &key, &table).await;

    let response = executor
        .execute(
            &key,
            &format!(
                "INSERT INTO {table} VALUES (1, 'a'); INSERT INTO {table} VALUES (2, 'b'); \
                 UPDATE {table} SET name = 'c' WHERE id = 2"
            ),
        )
        .await;
    let ExecuteResponse::Batch(batch) = &response else {
        panic!("Expected batch, got {:?}", response);
    };

    assert_eq!(batch.transaction_used, Some(true));
    assert_eq!(batch.results.len(), 3);
    assert_eq!(batch.results[2].row_count, 1);
    assert_eq!(count_rows(&executor, &key, &table).await, Value::Int(2));

    drop_table(&executor, &key, &table).await;
}

#[tokio::test]
async fn test_transaction_rolls_back_on_failure() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();
    let table = unique_table("pgc_rollback");
    create_table(&executor, &key, &table).await;

    let response = executor
        .execute(
            &key,
            &format!(
                "INSERT INTO {table} VALUES (1, 'a'); UPDATE {table} SET missing_column = 1"
            ),
        )
        .await;
    let ExecuteResponse::Failure(envelope) = &response else {
        panic!("Expected failure, got {:?}", response);
    };

    assert_eq!(envelope.transaction_used, Some(true));
    assert_eq!(envelope.code.as_deref(), Some("42703"));
    assert!(envelope
        .statement
        .as_deref()
        .unwrap()
        .starts_with(&format!("UPDATE {table}")));
    assert_eq!(count_rows(&executor, &key, &table).await, Value::Int(0));

    drop_table(&executor, &key, &table).await;
}

#[tokio::test]
async fn test_sequential_continues_after_failure() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();
    let table = unique_table("pgc_sequential");
    create_table(&executor, &key, &table).await;

    let response = executor
        .execute(
            &key,
            &format!(
                "SELECT * FROM no_such_table_pgc; INSERT INTO {table} VALUES (1, 'a'); \
                 SELECT name FROM {table}"
            ),
        )
        .await;
    let ExecuteResponse::Batch(batch) = &response else {
        panic!("Expected batch, got {:?}", response);
    };

    assert!(batch.error);
    assert_eq!(batch.transaction_used, None);
    let error = batch.results[0].error.as_ref().unwrap();
    assert_eq!(error.code.as_deref(), Some("42P01"));
    assert_eq!(batch.results[1].row_count, 1);
    assert_eq!(batch.results[2].rows[0][0], Value::Text("a".to_string()));

    drop_table(&executor, &key, &table).await;
}

#[tokio::test]
async fn test_syntax_error_reports_position() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();

    let response = executor.execute(&key, "SELEC 1").await;
    let ExecuteResponse::Failure(envelope) = &response else {
        panic!("Expected failure, got {:?}", response);
    };

    assert_eq!(envelope.code.as_deref(), Some("42601"));
    assert_eq!(envelope.severity.as_deref(), Some("ERROR"));
    assert_eq!(envelope.position, Some(1));
    assert_eq!(envelope.statement.as_deref(), Some("SELEC 1"));

    executor.pools().close_all_pools().await;
}

#[tokio::test]
async fn test_slow_statement_completes() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();

    let response = executor.execute(&key, "SELECT pg_sleep(1.2)").await;
    let ExecuteResponse::Single(result) = &response else {
        panic!("Expected single result, got {:?}", response);
    };

    assert!(result.execution_time >= 1000);
    assert_eq!(result.row_count, 1);

    executor.pools().close_all_pools().await;
}

#[tokio::test]
async fn test_blank_sql_touches_no_pool() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let executor = executor();

    let response = executor.execute(&key, "  \n ").await;
    assert_eq!(response.status(), ResponseStatus::ClientError);
    assert_eq!(executor.pools().pool_count().await, 0);
}
