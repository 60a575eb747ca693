//! Response envelopes returned by the executor.
//!
//! A single statement yields a flat [`StatementResult`], a batch yields a
//! [`BatchResult`], and anything that prevented execution yields an
//! [`ErrorEnvelope`].

use std::time::Duration;

use serde::Serialize;

use crate::db::{ColumnInfo, QueryResult, Row};
use crate::error::{ConsoleError, DatabaseErrorInfo};

/// Outcome of one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResult {
    pub rows: Vec<Row>,
    pub fields: Vec<ColumnInfo>,
    pub row_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Milliseconds from this statement's own dispatch.
    pub execution_time: u64,
    pub statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DatabaseErrorInfo>,
}

impl StatementResult {
    pub fn success(statement: impl Into<String>, result: QueryResult, elapsed: Duration) -> Self {
        Self {
            rows: result.rows,
            fields: result.columns,
            row_count: result.row_count,
            command: Some(result.command),
            execution_time: millis(elapsed),
            statement: statement.into(),
            error: None,
        }
    }

    pub fn failure(statement: impl Into<String>, error: &ConsoleError, elapsed: Duration) -> Self {
        Self {
            rows: Vec::new(),
            fields: Vec::new(),
            row_count: 0,
            command: None,
            execution_time: millis(elapsed),
            statement: statement.into(),
            error: Some(error.to_error_info()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a multi-statement batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Always true; lets clients tell batches from single results.
    pub multiple_results: bool,
    /// Results in statement order.
    pub results: Vec<StatementResult>,
    pub total_execution_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_used: Option<bool>,
    /// Set when at least one statement failed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl BatchResult {
    pub fn new(results: Vec<StatementResult>, elapsed: Duration, transaction_used: bool) -> Self {
        let error = results.iter().any(StatementResult::is_error);
        Self {
            multiple_results: true,
            results,
            total_execution_time: millis(elapsed),
            transaction_used: transaction_used.then_some(true),
            error,
        }
    }

    /// Number of statements that succeeded.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| !r.is_error()).count()
    }
}

/// A request that failed as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    pub execution_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_used: Option<bool>,
    #[serde(skip)]
    pub client_error: bool,
}

impl ErrorEnvelope {
    /// Builds the envelope for `error`, keeping any driver-reported fields.
    pub fn from_error(error: &ConsoleError, elapsed: Duration, statement: Option<String>) -> Self {
        let info = error.to_error_info();
        let statement = match error {
            ConsoleError::TransactionAborted { statement, .. } => Some(statement.clone()),
            _ => statement,
        };

        Self {
            error: info.message,
            code: info.code,
            severity: info.severity,
            routine: info.routine,
            detail: info.detail,
            hint: info.hint,
            position: info.position,
            statement,
            execution_time: millis(elapsed),
            transaction_used: None,
            client_error: error.is_client_error(),
        }
    }

    pub fn with_transaction(mut self) -> Self {
        self.transaction_used = Some(true);
        self
    }
}

/// Response to an execute request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecuteResponse {
    Single(StatementResult),
    Batch(BatchResult),
    Failure(ErrorEnvelope),
}

/// Coarse outcome of a response, mapped onto HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    ClientError,
    ServerError,
}

impl ResponseStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::ClientError => 400,
            Self::ServerError => 500,
        }
    }
}

impl ExecuteResponse {
    pub fn failure(error: &ConsoleError, elapsed: Duration) -> Self {
        Self::Failure(ErrorEnvelope::from_error(error, elapsed, None))
    }

    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::Single(result) if result.is_error() => ResponseStatus::ServerError,
            Self::Single(_) => ResponseStatus::Ok,
            Self::Batch(batch) if batch.error => ResponseStatus::ServerError,
            Self::Batch(_) => ResponseStatus::Ok,
            Self::Failure(envelope) if envelope.client_error => ResponseStatus::ClientError,
            Self::Failure(_) => ResponseStatus::ServerError,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == ResponseStatus::Ok
    }
}

fn millis(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}
