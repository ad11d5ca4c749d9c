//! Query-related data models.
//!
//! This module defines the positional-argument query request, the shaped
//! result set returned to callers, and transaction isolation levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ColumnType, Value};

/// A SQL statement with positional arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery {
    pub sql: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl SqlQuery {
    /// Create a new query without arguments.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Add an argument to this query.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace all arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Rows returned by `query_raw`, shaped for transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlResultSet {
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
}

impl SqlResultSet {
    /// Create an empty result set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            Self::ReadCommitted => write!(f, "READ COMMITTED"),
            Self::RepeatableRead => write!(f, "REPEATABLE READ"),
            Self::Snapshot => write!(f, "SNAPSHOT"),
            Self::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SNAPSHOT" => Ok(Self::Snapshot),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(format!("Unknown isolation level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = SqlQuery::new("SELECT * FROM users WHERE id = ? AND name = ?")
            .with_arg(1)
            .with_arg("alice");
        assert_eq!(query.args, vec![Value::Int(1), Value::Text("alice".into())]);
    }

    #[test]
    fn test_query_deserialize_without_args() {
        let query: SqlQuery = serde_json::from_str(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert!(query.args.is_empty());
    }

    #[test]
    fn test_result_set_empty() {
        let result = SqlResultSet::empty();
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"columnNames":[],"columnTypes":[],"rows":[]}"#
        );
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_string(), "READ COMMITTED");
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("sometimes".parse::<IsolationLevel>().is_err());
    }
}
