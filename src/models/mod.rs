//! Data models for the tagsql adapter.
//!
//! This module re-exports all model types used throughout the crate.

pub mod column;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use column::ColumnType;
pub use query::{IsolationLevel, SqlQuery, SqlResultSet};
pub use value::{PrimitiveClass, Value, iso_string};
