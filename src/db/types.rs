//! Query result types for pg-console.
//!
//! Defines the driver-level structures returned by a single statement.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Serialize, Serializer};

/// Represents the result of executing one SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column metadata for the result set.
    pub columns: Vec<ColumnInfo>,

    /// Rows of data.
    pub rows: Vec<Row>,

    /// Rows returned, or rows affected for statements without a result set.
    pub row_count: u64,

    /// Command tag (`SELECT`, `INSERT`, ...).
    pub command: String,
}

impl QueryResult {
    /// Creates a query result with the given columns and rows.
    pub fn with_data(command: impl Into<String>, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count,
            command: command.into(),
        }
    }

    /// Creates a result for a statement that returned no rows.
    pub fn affected(command: impl Into<String>, row_count: u64) -> Self {
        Self {
            row_count,
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type as reported by the server.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
///
/// Serializes to plain JSON: numbers, strings, booleans, nested JSON for
/// `json`/`jsonb` columns and base64 strings for binary data.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text value; also used for numeric, temporal and uuid columns.
    Text(String),

    /// Structured JSON value.
    Json(serde_json::Value),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Json(j) => j.serialize(serializer),
            Value::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
        }
    }
}

/// Returns the command tag for a statement, taken from its leading keyword.
pub fn command_tag(sql: &str) -> String {
    sql.trim_start()
        .split(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
        .next()
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Shortens a statement for messages and logs, marking the cut with `...`.
pub fn truncate_statement(sql: &str, max_chars: usize) -> String {
    match sql.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}
