//! Host client boundary.
//!
//! The native client speaks a template-call convention: a statement is an
//! ordered list of literal SQL fragments interleaved with bound values, never
//! a single string with numbered placeholders. These traits describe that
//! boundary so the pool, translator and transaction logic stay independent of
//! any particular driver.

use async_trait::async_trait;

use crate::error::DbResult;
use crate::models::Value;

/// Raw result of one template call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeResult {
    /// Column names in select-list order.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows reported as affected by the command tag.
    pub affected_rows: Option<u64>,
    /// Number of rows returned or touched, as the client counts them.
    pub count: u64,
}

impl NativeResult {
    /// Create a result for write statements.
    pub fn affected(affected_rows: u64) -> Self {
        Self {
            affected_rows: Some(affected_rows),
            count: affected_rows,
            ..Self::default()
        }
    }

    /// Affected rows when non-zero, otherwise the row count.
    pub fn affected_count(&self) -> u64 {
        match self.affected_rows {
            Some(n) if n > 0 => n,
            _ => self.count,
        }
    }
}

/// Executes one template call.
#[async_trait]
pub trait TemplateExecutor: Send + Sync {
    /// Run `fragments` with `values` bound between them.
    ///
    /// Well-formed calls carry `values.len() + 1` fragments. A single fragment
    /// with any number of values is the untranslated fallback form.
    async fn call(&self, fragments: &[String], values: Vec<Value>) -> DbResult<NativeResult>;
}

/// One physical connection owned by the pool.
#[async_trait]
pub trait NativeClient: TemplateExecutor + 'static {
    type Reserved: ReservedClient;

    /// Take a dedicated session for a transaction. While reserved, the
    /// connection must not be handed to any other caller.
    async fn reserve(&self) -> DbResult<Self::Reserved>;

    /// Close the physical connection.
    async fn close(&self) -> DbResult<()>;
}

/// A dedicated session carved out of a pooled connection.
#[async_trait]
pub trait ReservedClient: TemplateExecutor + 'static {
    /// Give the session back to its parent connection.
    async fn release(&self);
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: NativeClient;

    async fn connect(&self, connection_string: &str) -> DbResult<Self::Client>;
}

/// Build the fragment list for a statement without placeholders.
pub fn single_fragment(sql: &str) -> Vec<String> {
    vec![sql.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_count_prefers_affected_rows() {
        let result = NativeResult {
            affected_rows: Some(3),
            count: 7,
            ..NativeResult::default()
        };
        assert_eq!(result.affected_count(), 3);
    }

    #[test]
    fn test_affected_count_falls_back_to_count() {
        let zero = NativeResult {
            affected_rows: Some(0),
            count: 2,
            ..NativeResult::default()
        };
        assert_eq!(zero.affected_count(), 2);
        assert_eq!(NativeResult::default().affected_count(), 0);
    }
}
