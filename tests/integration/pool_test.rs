//! Pool manager integration tests.
//!
//! Tests pool caching, statistics and shutdown against a real server.

use std::sync::Arc;

use futures::FutureExt;
use pg_console::config::PoolSettings;
use pg_console::db::Value;
use pg_console::pool::PoolManager;

use super::get_test_key;

#[tokio::test]
async fn test_query_reuses_pool() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let pools = PoolManager::new(PoolSettings::default());

    let first = pools.query(&key, "SELECT 1 AS num", &[]).await.unwrap();
    let second = pools.query(&key, "SELECT 2 AS num", &[]).await.unwrap();

    assert_eq!(first.columns[0].name, "num");
    assert_eq!(first.rows[0][0], Value::Int(1));
    assert_eq!(second.rows[0][0], Value::Int(2));
    assert_eq!(pools.pool_count().await, 1);

    pools.close_all_pools().await;
    assert_eq!(pools.pool_count().await, 0);
}

#[tokio::test]
async fn test_query_with_parameters() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let pools = PoolManager::new(PoolSettings::default());
    let result = pools
        .query(
            &key,
            "SELECT $1::int8 + 1 AS next, $2::text AS label",
            &[Value::Int(41), Value::Text("answer".to_string())],
        )
        .await
        .unwrap();

    assert_eq!(result.rows[0][0], Value::Int(42));
    assert_eq!(result.rows[0][1], Value::Text("answer".to_string()));

    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_stats_report_idle_pool() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let pools = PoolManager::new(PoolSettings::default());
    pools.query(&key, "SELECT 1", &[]).await.unwrap();

    let stats = pools.pool_stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].key, key.cache_key());
    assert_eq!(stats[0].in_use, 0);
    assert!(stats[0].total_count >= 1);

    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_session_keeps_state_between_statements() {
    let Some(key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let pools = Arc::new(PoolManager::new(PoolSettings::default()));
    let value = pools
        .query_with_client(&key, |session| {
            async move {
                session.execute("SET application_name = 'pg-console-test'", &[]).await?;
                let result = session.execute("SHOW application_name", &[]).await?;
                Ok(result.rows[0][0].clone())
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(value, Value::Text("pg-console-test".to_string()));
    pools.close_all_pools().await;
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    let Some(mut key) = get_test_key() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    key.host = "127.0.0.1".to_string();
    key.port = 1;

    let settings = PoolSettings {
        connect_timeout: std::time::Duration::from_secs(2),
        ..PoolSettings::default()
    };
    let pools = PoolManager::new(settings);

    let error = pools.query(&key, "SELECT 1", &[]).await.unwrap_err();
    assert!(!error.is_client_error());

    // The failed pool stays cached until the idle sweep removes it.
    let keys: Vec<String> = pools.pool_stats().await.into_iter().map(|s| s.key).collect();
    assert_eq!(keys, vec![key.cache_key()]);

    pools.close_all_pools().await;
}
