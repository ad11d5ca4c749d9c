//! Database access layer.
//!
//! This module provides:
//! - The template-call client boundary and its Postgres implementation
//! - Connection-string normalization and connection establishment
//! - The adaptive connection pool
//! - Placeholder translation and argument coercion
//! - Result shaping and column type inference
//! - Transactions on reserved connections

pub mod client;
pub mod coerce;
pub mod conn_string;
pub mod executor;
pub mod factory;
pub mod placeholders;
pub mod pool;
pub mod postgres;
pub mod transaction;
pub mod types;

pub use client::{Connector, NativeClient, NativeResult, ReservedClient, TemplateExecutor};
pub use executor::{ADAPTER_NAME, Adapter, PROVIDER};
pub use factory::ConnectionFactory;
pub use pool::{ConnectionGuard, Pool, PoolStatus, PooledConnection};
pub use postgres::{PgClient, PgConnector, connect};
pub use transaction::Transaction;
