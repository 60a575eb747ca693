//! Keyword-based SQL splitting and classification.
//!
//! Keyword matching runs against the upper-cased statement; the statement text
//! itself is returned in its original case.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ConsoleError, Result};

use super::{Complexity, ParsedStatement, StatementType, DEFAULT_ROW_LIMIT};

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("static regex is valid"));
    };
}

static_regex!(LINE_COMMENT, r"--[^\n]*");
static_regex!(BLOCK_COMMENT, r"(?s)/\*.*?\*/");
static_regex!(WHITESPACE, r"\s+");
static_regex!(LEADING_KEYWORD, r"^([A-Z_]+)");

static_regex!(SELECT_TOKEN, r"\bSELECT\b");
static_regex!(MUTATION_KEYWORD, r"INSERT|UPDATE|DELETE");

static_regex!(
    FROM_CLAUSE,
    r"(?is)\bFROM\s+(.+?)(?:\bWHERE\b|\bGROUP\b|\bORDER\b|\bLIMIT\b|\bHAVING\b|$)"
);
static_regex!(JOIN_TARGET, r"(?i)\bJOIN\s+([^\s,;()]+)");
static_regex!(INSERT_TARGET, r"(?i)\bINSERT\s+INTO\s+([^\s,;()]+)");
static_regex!(UPDATE_TARGET, r"(?i)\bUPDATE\s+([^\s,;()]+)");
static_regex!(DELETE_TARGET, r"(?i)\bDELETE\s+FROM\s+([^\s,;()]+)");

/// Aggregate functions that add to the complexity score.
const AGGREGATES: [&str; 6] = ["COUNT", "SUM", "AVG", "MAX", "MIN", "ARRAY_AGG"];

/// Words that can follow FROM/JOIN but never name a table.
const NON_TABLE_WORDS: [&str; 4] = ["LATERAL", "ONLY", "SELECT", "UNNEST"];

/// Removes `-- ...` line comments and `/* ... */` block comments.
pub fn strip_comments(sql: &str) -> String {
    let without_lines = LINE_COMMENT.replace_all(sql, "");
    BLOCK_COMMENT.replace_all(&without_lines, "").into_owned()
}

/// Splits text on semicolons that are outside single-quoted literals.
///
/// Returned statements are trimmed and never empty.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;

    for ch in sql.chars() {
        match ch {
            // A doubled quote ('') toggles twice and stays inside the literal.
            '\'' => {
                in_literal = !in_literal;
                current.push(ch);
            }
            ';' if !in_literal => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Parses raw SQL text into an ordered list of classified statements.
///
/// Returns [`ConsoleError::NoStatements`] when nothing executable remains
/// after comments and empty statements are removed.
pub fn parse_query(sql: &str) -> Result<Vec<ParsedStatement>> {
    let statements: Vec<ParsedStatement> = split_statements(&strip_comments(sql))
        .into_iter()
        .map(classify_statement)
        .collect();

    if statements.is_empty() {
        return Err(ConsoleError::NoStatements);
    }

    Ok(statements)
}

/// Classifies a single, already trimmed and comment-free statement.
fn classify_statement(sql: String) -> ParsedStatement {
    let upper = sql.to_uppercase();
    let leading = LEADING_KEYWORD
        .captures(&upper)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("");

    let leads_with_cte = leading == "WITH";
    let statement_type = match StatementType::from_keyword(leading) {
        StatementType::With if SELECT_TOKEN.is_match(&upper) => StatementType::Select,
        other => other,
    };

    let is_read_only = if leads_with_cte {
        !MUTATION_KEYWORD.is_match(&upper)
    } else {
        matches!(
            statement_type,
            StatementType::Select | StatementType::Explain | StatementType::Analyze
        )
    };

    let has_subqueries = SELECT_TOKEN.find_iter(&upper).count() > 1;
    let tables = extract_tables(&sql, statement_type);
    let score = complexity_score(&upper, tables.len(), has_subqueries);

    ParsedStatement {
        sql,
        statement_type,
        is_read_only,
        estimated_complexity: Complexity::from_score(score),
        has_subqueries,
        tables,
    }
}

/// Extracts referenced table names. Anything unrecognizable is skipped.
fn extract_tables(sql: &str, statement_type: StatementType) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();

    match statement_type {
        StatementType::Select | StatementType::With => {
            for caps in FROM_CLAUSE.captures_iter(sql) {
                let Some(clause) = caps.get(1) else { continue };
                for candidate in clause.as_str().split(',') {
                    let first_word = candidate.split_whitespace().next().unwrap_or("");
                    tables.extend(clean_table_name(first_word));
                }
            }
            for caps in JOIN_TARGET.captures_iter(sql) {
                tables.extend(caps.get(1).and_then(|m| clean_table_name(m.as_str())));
            }
        }
        StatementType::Insert => {
            tables.extend(first_capture(&INSERT_TARGET, sql));
        }
        StatementType::Update => {
            tables.extend(first_capture(&UPDATE_TARGET, sql));
        }
        StatementType::Delete => {
            tables.extend(first_capture(&DELETE_TARGET, sql));
        }
        _ => {}
    }

    tables
}

fn first_capture(regex: &Regex, sql: &str) -> Option<String> {
    regex
        .captures(sql)
        .and_then(|c| c.get(1))
        .and_then(|m| clean_table_name(m.as_str()))
}

/// Strips quoting and schema qualification; rejects non-identifiers.
fn clean_table_name(raw: &str) -> Option<String> {
    let unquoted: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
        .collect();
    let name = unquoted.rsplit('.').next().unwrap_or("").trim();

    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
    if !starts_ok || !rest_ok {
        return None;
    }
    if NON_TABLE_WORDS.contains(&name.to_uppercase().as_str()) {
        return None;
    }

    Some(name.to_string())
}

/// Additive complexity heuristic over the upper-cased statement.
///
/// Keywords and aggregate names count on plain substring presence, so
/// `ADMIN` counts as `MIN` and `OVERLAPS` as `OVER`.
fn complexity_score(upper: &str, table_count: usize, has_subqueries: bool) -> f64 {
    let mut score = table_count as f64;

    if has_subqueries {
        score += 2.0;
    }
    for keyword in ["GROUP BY", "ORDER BY", "DISTINCT"] {
        if upper.contains(keyword) {
            score += 1.0;
        }
    }
    if upper.contains("UNION") {
        score += 2.0;
    }
    if upper.contains("INTERSECT") || upper.contains("EXCEPT") {
        score += 2.0;
    }
    if upper.contains("WINDOW") || upper.contains("OVER") {
        score += 2.0;
    }

    let aggregates = AGGREGATES.iter().filter(|name| upper.contains(*name)).count();
    score += 0.5 * aggregates as f64;
    score += 0.5 * upper.matches("JOIN").count() as f64;

    score
}

/// Collapses whitespace and appends a row limit to unbounded SELECTs.
///
/// The limit is skipped when the statement already mentions `LIMIT`,
/// `COUNT(`, `GROUP BY` or `DISTINCT` anywhere in its text.
pub fn optimize_query(sql: &str) -> String {
    let collapsed = WHITESPACE.replace_all(sql.trim(), " ").into_owned();
    let upper = sql.to_uppercase();

    let is_select = upper.trim_start().starts_with("SELECT");
    let already_bounded = upper.contains("LIMIT")
        || upper.contains("COUNT(")
        || upper.contains("GROUP BY")
        || upper.contains("DISTINCT");

    if is_select && !already_bounded {
        format!("{collapsed} LIMIT {DEFAULT_ROW_LIMIT}")
    } else {
        collapsed
    }
}
