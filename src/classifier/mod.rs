//! Statement classification module.
//!
//! Splits raw SQL text into statements, classifies each one by type and
//! read/write nature, and decides how a batch should be executed. The
//! classification is keyword based, not a grammar: it only has to be good
//! enough to pick a safe execution strategy.

mod parser;

pub use parser::{optimize_query, parse_query, split_statements, strip_comments};

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Row limit appended to unbounded SELECT statements by [`optimize_query`].
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// The type of SQL statement, taken from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Explain,
    Analyze,
    With,
    Unknown,
}

impl StatementType {
    /// Maps a leading keyword (upper-case) to a statement type.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" => Self::Create,
            "ALTER" => Self::Alter,
            "DROP" => Self::Drop,
            "EXPLAIN" => Self::Explain,
            "ANALYZE" => Self::Analyze,
            "WITH" => Self::With,
            _ => Self::Unknown,
        }
    }

    /// Returns the keyword form of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
            Self::Alter => "ALTER",
            Self::Drop => "DROP",
            Self::Explain => "EXPLAIN",
            Self::Analyze => "ANALYZE",
            Self::With => "WITH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory cost estimate for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Buckets a heuristic score: `<= 2` low, `<= 5` medium, otherwise high.
    pub fn from_score(score: f64) -> Self {
        if score <= 2.0 {
            Self::Low
        } else if score <= 5.0 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// One statement extracted from a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedStatement {
    /// Trimmed statement text with comments removed, in its original case.
    pub sql: String,
    #[serde(rename = "type")]
    pub statement_type: StatementType,
    pub is_read_only: bool,
    pub estimated_complexity: Complexity,
    pub has_subqueries: bool,
    /// Referenced table names (best effort).
    pub tables: BTreeSet<String>,
}

/// How a batch of statements is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// A single statement, executed on its own.
    Direct,
    /// Read-only statements executed in parallel on independent connections.
    Concurrent,
    /// Two or more writes executed in order inside BEGIN/COMMIT on one connection.
    Transaction,
    /// Everything else: executed in order, one call per statement.
    Sequential,
}

impl ExecutionStrategy {
    /// Picks the strategy for a non-empty batch.
    pub fn for_batch(statements: &[ParsedStatement]) -> Self {
        if statements.len() <= 1 {
            Self::Direct
        } else if can_execute_concurrently(statements) {
            Self::Concurrent
        } else if should_use_transaction(statements) {
            Self::Transaction
        } else {
            Self::Sequential
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Concurrent => write!(f, "concurrent"),
            Self::Transaction => write!(f, "transaction"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Returns true if every statement is read-only.
pub fn can_execute_concurrently(statements: &[ParsedStatement]) -> bool {
    statements.iter().all(|s| s.is_read_only)
}

/// Returns true if the batch contains more than one write statement.
pub fn should_use_transaction(statements: &[ParsedStatement]) -> bool {
    statements.iter().filter(|s| !s.is_read_only).count() > 1
}
