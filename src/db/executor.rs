//! Query execution.
//!
//! The [`Adapter`] is the public facade: it acquires a pooled connection,
//! translates placeholders, coerces arguments, runs the template call, shapes
//! the result and always releases the connection afterwards.

use tracing::{error, trace};

use crate::config::AdapterConfig;
use crate::db::client::{Connector, NativeResult, TemplateExecutor, single_fragment};
use crate::db::coerce::coerce_args;
use crate::db::factory::ConnectionFactory;
use crate::db::placeholders::translate;
use crate::db::pool::{ConnectionGuard, Pool, PoolStatus};
use crate::db::transaction::Transaction;
use crate::db::types::shape_result;
use crate::error::DbResult;
use crate::models::{IsolationLevel, SqlQuery, SqlResultSet, Value};

/// Database provider served by this adapter.
pub const PROVIDER: &str = "postgres";

/// Identifier reported by the adapter and its transactions.
pub const ADAPTER_NAME: &str = "tagsql-postgres";

// =============================================================================
// Statement Pipeline
// =============================================================================

/// Run one positional-argument statement through `executor`.
///
/// Zero-argument statements skip translation and coercion. When the markers
/// cannot be reconciled with the argument count, the SQL is passed through as
/// a single fragment with the coerced arguments in caller order.
pub async fn run_statement<E>(executor: &E, sql: &str, args: Vec<Value>) -> DbResult<NativeResult>
where
    E: TemplateExecutor + ?Sized,
{
    if args.is_empty() {
        return executor.call(&single_fragment(sql), Vec::new()).await;
    }

    match translate(sql, args.len()) {
        Some(template) => {
            // Slot order matches caller order, so `$n` in the rendered SQL is caller position n.
            let args = if template.is_in_caller_order() {
                coerce_args(&template.to_numbered_sql(), args)
            } else {
                coerce_args(sql, args)
            };
            let values = template.bind(&args);
            executor.call(&template.fragments, values).await
        }
        None => {
            trace!(args = args.len(), "Placeholders not reconciled, passing SQL through");
            let args = coerce_args(sql, args);
            executor.call(&single_fragment(sql), args).await
        }
    }
}

/// Split a script on `;` into trimmed, non-empty statements.
pub fn split_script(script: &str) -> impl Iterator<Item = &str> {
    script.split(';').map(str::trim).filter(|s| !s.is_empty())
}

// =============================================================================
// Adapter
// =============================================================================

/// Positional-argument SQL adapter over a template-call client.
pub struct Adapter<K: Connector> {
    pool: Pool<K>,
}

impl<K: Connector> std::fmt::Debug for Adapter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("provider", &PROVIDER)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<K: Connector> Adapter<K> {
    /// Create an adapter over an existing pool.
    pub fn new(pool: Pool<K>) -> Self {
        Self { pool }
    }

    /// Create an adapter with its own pool. No connection is opened yet.
    pub fn with_connector(connector: K, config: &AdapterConfig) -> Self {
        let factory = ConnectionFactory::new(connector, &config.connection_string);
        Self::new(Pool::new(factory, &config.pool))
    }

    pub fn provider(&self) -> &'static str {
        PROVIDER
    }

    pub fn adapter_name(&self) -> &'static str {
        ADAPTER_NAME
    }

    pub fn pool(&self) -> &Pool<K> {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Run a row-returning statement.
    pub async fn query_raw(&self, query: SqlQuery) -> DbResult<SqlResultSet> {
        let result = self.run(query).await?;
        Ok(shape_result(result))
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute_raw(&self, query: SqlQuery) -> DbResult<u64> {
        let result = self.run(query).await?;
        Ok(result.affected_count())
    }

    /// Run each `;`-separated statement of `script` in order on one connection.
    pub async fn execute_script(&self, script: &str) -> DbResult<()> {
        let conn = ConnectionGuard::acquire(&self.pool).await?;
        for statement in split_script(script) {
            if let Err(e) = conn.call(&single_fragment(statement), Vec::new()).await {
                error!(error = %e, "Script statement failed");
                return Err(e);
            }
        }
        conn.release();
        Ok(())
    }

    /// Start a transaction on a reserved connection.
    pub async fn start_transaction(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> DbResult<Transaction<K>> {
        Transaction::begin(&self.pool, isolation_level).await
    }

    /// Close every pooled connection and reject queued acquisitions.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
    }

    async fn run(&self, query: SqlQuery) -> DbResult<NativeResult> {
        let conn = ConnectionGuard::acquire(&self.pool).await?;
        let result = run_statement(&*conn, &query.sql, query.args).await;
        conn.release();

        result.inspect_err(|e| error!(error = %e, "Query failed"))
    }
}
