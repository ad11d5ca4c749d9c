//! tagsql
//!
//! Positional-parameter SQL adapter for template-call database clients.
//! Statements written with `?` or `$n` markers are translated into literal
//! fragments and bound values, run over an adaptive connection pool, and
//! returned as typed result sets.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{AdapterConfig, Config, PoolOptions, TlsOptions};
pub use db::{Adapter, Transaction, connect};
pub use error::{DbError, DbResult};
pub use models::{ColumnType, IsolationLevel, SqlQuery, SqlResultSet, Value};
