//! Integration tests for pg-console.
//!
//! These tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.

use pg_console::config::ConnectionConfig;
use pg_console::pool::PoolKey;

pub mod executor_test;
pub mod pool_test;

/// Helper to get the test pool key from DATABASE_URL.
pub fn get_test_key() -> Option<PoolKey> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    config.to_credentials().to_pool_key().ok()
}

/// Returns a table name unlikely to collide with concurrent test runs.
pub fn unique_table(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("{prefix}_{}_{nanos}", std::process::id())
}
