//! Database abstraction layer for pg-console.
//!
//! Provides a trait-based interface over connection pools so the pool manager
//! and the query executor can run against PostgreSQL or an in-memory mock.

mod mock;
mod postgres;
mod types;

pub use mock::{MockConnector, MockPool, UNREACHABLE_HOST};
pub use postgres::{PgConnector, PostgresPool};
pub use types::{command_tag, truncate_statement, ColumnInfo, QueryResult, Row, Value};

use crate::config::PoolSettings;
use crate::error::Result;
use crate::pool::PoolKey;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Connection counts reported by a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    /// Open physical connections.
    pub total: u32,
    /// Open connections not currently checked out.
    pub idle: u32,
    /// Callers waiting for a connection.
    pub waiting: u32,
}

/// Creates database pools for a credential set.
///
/// Creation must not require a reachable server: connection failures surface
/// on first use.
pub trait PoolConnector: Send + Sync {
    fn create_pool(&self, key: &PoolKey, settings: &PoolSettings) -> Result<Arc<dyn DatabasePool>>;
}

/// A pool of connections to one database, shared by many callers.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Executes one statement on any available connection.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Checks out a dedicated connection, held until the session is dropped.
    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>>;

    /// Current connection counts.
    fn connection_counts(&self) -> ConnectionCounts;

    /// Closes all connections. Further use of the pool fails.
    async fn close(&self) -> Result<()>;
}

/// A single checked-out connection.
///
/// Dropping a session returns its connection to the pool. A session dropped
/// inside an open transaction discards the connection instead.
#[async_trait]
pub trait DatabaseSession: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
