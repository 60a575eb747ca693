//! Error types for pg-console.
//!
//! Defines the main error enum used throughout the execution core.

use serde::Serialize;
use thiserror::Error;

/// Driver-reported details about a failed statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseErrorInfo {
    /// Primary error message.
    pub message: String,

    /// SQLSTATE code (e.g. `42P01`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Severity reported by the server (`ERROR`, `FATAL`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Server source routine that raised the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// 1-based character offset into the statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl DatabaseErrorInfo {
    /// Creates error info carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Main error type for pg-console operations.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Malformed request (missing credentials, missing SQL).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The submitted text contained no executable statements.
    #[error("No valid SQL statements found")]
    NoStatements,

    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors (syntax errors, constraint violations, timeouts).
    #[error("Query error: {}", .0.message)]
    Query(DatabaseErrorInfo),

    /// A statement inside a transaction failed and the transaction was rolled back.
    #[error("Transaction failed at statement: {statement}. Error: {}", .cause.message)]
    TransactionAborted {
        statement: String,
        cause: DatabaseErrorInfo,
        rollback_error: Option<String>,
    },

    /// Configuration errors (invalid config file, bad values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConsoleError {
    /// Creates an invalid request error with the given message.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error carrying only a message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(DatabaseErrorInfo::new(msg))
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the caller supplied bad input and nothing was executed.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::NoStatements)
    }

    /// Converts the error into the per-statement error payload.
    ///
    /// Driver fields are preserved for query errors; other variants only carry
    /// their message.
    pub fn to_error_info(&self) -> DatabaseErrorInfo {
        match self {
            Self::Query(info) => info.clone(),
            Self::TransactionAborted {
                cause,
                rollback_error,
                ..
            } => {
                let mut info = cause.clone();
                info.message = self.to_string();
                if let Some(rollback) = rollback_error {
                    info.message.push_str(&format!(" (rollback failed: {rollback})"));
                }
                info
            }
            Self::InvalidRequest(msg)
            | Self::Connection(msg)
            | Self::Config(msg)
            | Self::Internal(msg) => DatabaseErrorInfo::new(msg.clone()),
            Self::NoStatements => DatabaseErrorInfo::new(self.to_string()),
        }
    }
}

/// Result type alias using ConsoleError.
pub type Result<T> = std::result::Result<T, ConsoleError>;
