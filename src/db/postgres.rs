//! PostgreSQL pool implementation.
//!
//! Provides `PgConnector`, which builds lazily-connecting sqlx pools with the
//! session safety settings applied, and the `DatabasePool` / `DatabaseSession`
//! implementations on top of them.

use crate::config::PoolSettings;
use crate::db::{
    command_tag, ColumnInfo, ConnectionCounts, DatabasePool, DatabaseSession, PoolConnector,
    QueryResult, Row, Value,
};
use crate::error::{ConsoleError, DatabaseErrorInfo, Result};
use crate::pool::PoolKey;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgConnection, PgDatabaseError, PgErrorPosition, PgPool,
    PgPoolOptions, PgRow, PgSslMode,
};
use sqlx::query::Query;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Uuid};
use sqlx::{Column as SqlxColumn, Either, Executor, Postgres, Row as SqlxRow, Statement, TypeInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Creates sqlx-backed PostgreSQL pools.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    /// Builds the connect options for a credential set.
    ///
    /// Every connection opened with these options carries the statement,
    /// lock and idle-in-transaction timeouts from `settings`.
    pub fn connect_options(key: &PoolKey, settings: &PoolSettings) -> PgConnectOptions {
        let ssl_mode = if key.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };

        PgConnectOptions::new()
            .host(&key.host)
            .port(key.port)
            .username(&key.user)
            .password(&key.password)
            .database(&key.database)
            .ssl_mode(ssl_mode)
            .application_name(&settings.application_name)
            .options([
                (
                    "statement_timeout",
                    settings.statement_timeout.as_millis().to_string(),
                ),
                ("lock_timeout", settings.lock_timeout.as_millis().to_string()),
                (
                    "idle_in_transaction_session_timeout",
                    settings.idle_in_transaction_timeout.as_millis().to_string(),
                ),
            ])
    }
}

impl PoolConnector for PgConnector {
    fn create_pool(&self, key: &PoolKey, settings: &PoolSettings) -> Result<Arc<dyn DatabasePool>> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .idle_timeout(settings.connection_idle_timeout)
            .acquire_timeout(settings.connect_timeout)
            .connect_lazy_with(Self::connect_options(key, settings));

        debug!(pool = %key, "Created PostgreSQL pool");

        Ok(Arc::new(PostgresPool {
            pool,
            key: key.clone(),
            query_timeout: settings.query_timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

/// A sqlx pool for one credential set.
#[derive(Debug)]
pub struct PostgresPool {
    pool: PgPool,
    key: PoolKey,
    query_timeout: Duration,
    waiting: Arc<AtomicUsize>,
}

/// Counts a caller as waiting for a connection until dropped.
struct WaitGuard(Arc<AtomicUsize>);

impl WaitGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PostgresPool {
    async fn checkout(&self) -> Result<PoolConnection<Postgres>> {
        let _waiting = WaitGuard::new(&self.waiting);
        self.pool
            .acquire()
            .await
            .map_err(|e| map_connection_error(e, &self.key))
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let mut conn = self.checkout().await?;
        run_statement(&mut conn, sql, params, self.query_timeout).await
    }

    async fn acquire(&self) -> Result<Box<dyn DatabaseSession>> {
        let conn = self.checkout().await?;
        Ok(Box::new(PostgresSession {
            conn,
            query_timeout: self.query_timeout,
            in_transaction: false,
        }))
    }

    fn connection_counts(&self) -> ConnectionCounts {
        ConnectionCounts {
            total: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            waiting: self.waiting.load(Ordering::SeqCst) as u32,
        }
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// A connection checked out of a `PostgresPool`.
pub struct PostgresSession {
    conn: PoolConnection<Postgres>,
    query_timeout: Duration,
    in_transaction: bool,
}

impl PostgresSession {
    async fn control(&mut self, command: &str) -> Result<()> {
        (&mut *self.conn)
            .execute(command)
            .await
            .map(|_| ())
            .map_err(map_query_error)
    }
}

#[async_trait]
impl DatabaseSession for PostgresSession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        run_statement(&mut self.conn, sql, params, self.query_timeout).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.control("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.control("COMMIT").await;
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    async fn rollback(&mut self) -> Result<()> {
        let result = self.control("ROLLBACK").await;
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("Session dropped inside an open transaction, discarding connection");
            self.conn.close_on_drop();
        }
    }
}

/// Runs one statement on a connection and collects its results.
async fn run_statement(
    conn: &mut PgConnection,
    sql: &str,
    params: &[Value],
    query_timeout: Duration,
) -> Result<QueryResult> {
    let command = command_tag(sql);

    let work = async {
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = bind_value(query, param);
        }

        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut rows_affected = 0u64;

        let mut stream = (&mut *conn).fetch_many(query);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => rows_affected += done.rows_affected(),
                Either::Right(row) => {
                    if columns.is_none() {
                        columns = Some(column_info(row.columns()));
                    }
                    rows.push(convert_row(&row));
                }
            }
        }
        drop(stream);

        // Empty result sets still report their columns
        if columns.is_none() && matches!(command.as_str(), "SELECT" | "WITH") {
            if let Ok(statement) = (&mut *conn).prepare(sql).await {
                if !statement.columns().is_empty() {
                    columns = Some(column_info(statement.columns()));
                }
            }
        }

        Ok::<_, sqlx::Error>((columns, rows, rows_affected))
    };

    let (columns, rows, rows_affected) = tokio::time::timeout(query_timeout, work)
        .await
        .map_err(|_| {
            ConsoleError::query(format!(
                "Query timed out after {} seconds",
                query_timeout.as_secs()
            ))
        })?
        .map_err(map_query_error)?;

    Ok(match columns {
        Some(columns) => QueryResult::with_data(command, columns, rows),
        None => QueryResult::affected(command, rows_affected),
    })
}

fn column_info(columns: &[sqlx::postgres::PgColumn]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Json(j) => query.bind(j.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Decodes a nullable column, mapping NULL and decode failures to `Value::Null`.
fn decode<'r, T>(row: &'r PgRow, index: usize, map: impl FnOnce(T) -> Value) -> Value
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index)
        .ok()
        .flatten()
        .map(map)
        .unwrap_or(Value::Null)
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => decode::<bool>(row, index, Value::Bool),
        "INT2" | "SMALLINT" => decode::<i16>(row, index, |v| Value::Int(v as i64)),
        "INT4" | "INT" | "INTEGER" => decode::<i32>(row, index, |v| Value::Int(v as i64)),
        "INT8" | "BIGINT" => decode::<i64>(row, index, Value::Int),
        "FLOAT4" | "REAL" => decode::<f32>(row, index, |v| Value::Float(v as f64)),
        "FLOAT8" | "DOUBLE PRECISION" => decode::<f64>(row, index, Value::Float),
        // Exact decimals stay textual so no precision is lost
        "NUMERIC" => decode::<Decimal>(row, index, |v| Value::Text(v.to_string())),
        "JSON" | "JSONB" => decode::<serde_json::Value>(row, index, Value::Json),
        "BYTEA" => decode::<Vec<u8>>(row, index, Value::Bytes),
        "TIMESTAMPTZ" => decode::<DateTime<Utc>>(row, index, |v| Value::Text(v.to_rfc3339())),
        "TIMESTAMP" => decode::<NaiveDateTime>(row, index, |v| Value::Text(v.to_string())),
        "DATE" => decode::<NaiveDate>(row, index, |v| Value::Text(v.to_string())),
        "TIME" => decode::<NaiveTime>(row, index, |v| Value::Text(v.to_string())),
        "UUID" => decode::<Uuid>(row, index, |v| Value::Text(v.to_string())),
        _ => decode::<String>(row, index, Value::Text),
    }
}

/// Maps sqlx errors raised while obtaining a connection to user-friendly messages.
fn map_connection_error(error: sqlx::Error, key: &PoolKey) -> ConsoleError {
    let host = &key.host;
    let port = key.port;
    let error_str = error.to_string().to_lowercase();

    if matches!(error, sqlx::Error::PoolClosed) {
        ConsoleError::connection(format!("Pool for {key} has been closed"))
    } else if error_str.contains("connection refused") || error_str.contains("could not connect")
    {
        ConsoleError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        ConsoleError::connection(format!(
            "Authentication failed for user '{}'. Check your credentials.",
            key.user
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        ConsoleError::connection(format!("Database '{}' does not exist.", key.database))
    } else if error_str.contains("ssl") || error_str.contains("tls") {
        ConsoleError::connection(format!(
            "SSL negotiation with {host}:{port} failed: {error}"
        ))
    } else if matches!(error, sqlx::Error::PoolTimedOut)
        || error_str.contains("timed out")
        || error_str.contains("timeout")
    {
        ConsoleError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        ConsoleError::connection(error.to_string())
    }
}

/// Maps sqlx errors raised by a statement, keeping the server-reported fields.
fn map_query_error(error: sqlx::Error) -> ConsoleError {
    let Some(db_error) = error.as_database_error() else {
        return match error {
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                ConsoleError::connection(error.to_string())
            }
            other => ConsoleError::query(other.to_string()),
        };
    };

    let mut info = DatabaseErrorInfo::new(db_error.message());
    info.code = db_error.code().map(|c| c.into_owned());

    if let Some(pg_error) = db_error.try_downcast_ref::<PgDatabaseError>() {
        info.severity = Some(format!("{:?}", pg_error.severity()).to_uppercase());
        info.routine = pg_error.routine().map(String::from);
        info.detail = pg_error.detail().map(String::from);
        info.hint = pg_error.hint().map(String::from);
        info.position = match pg_error.position() {
            Some(PgErrorPosition::Original(position)) => Some(position),
            _ => None,
        };
    }

    ConsoleError::Query(info)
}
