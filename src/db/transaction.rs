//! Transactions on a reserved connection.
//!
//! A transaction takes a pooled connection, reserves a dedicated session on it
//! and runs `BEGIN` there. Every statement of the transaction goes through that
//! session until `commit` or `rollback` finishes it, after which both the
//! session and the pooled connection are given back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use crate::db::client::{
    Connector, NativeClient, ReservedClient, TemplateExecutor, single_fragment,
};
use crate::db::executor::{ADAPTER_NAME, PROVIDER, run_statement};
use crate::db::pool::{ConnectionGuard, Pool, PooledConnection};
use crate::db::types::shape_result;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, SqlQuery, SqlResultSet};

type Reserved<K> = <<K as Connector>::Client as NativeClient>::Reserved;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    Rollback,
}

/// An open transaction.
///
/// Dropping a transaction that was neither committed nor rolled back rolls it
/// back in a background task.
pub struct Transaction<K: Connector> {
    id: String,
    pool: Pool<K>,
    conn: PooledConnection<K::Client>,
    reserved: Arc<Reserved<K>>,
    finished: AtomicBool,
    aborted: AtomicBool,
}

impl<K: Connector> std::fmt::Debug for Transaction<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection", &self.conn.id())
            .field("finished", &self.is_finished())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> Transaction<K> {
    /// Acquire a connection from `pool`, reserve it and issue `BEGIN`.
    ///
    /// On any failure the connection goes back to the pool and no transaction
    /// exists. A caller that gives up while `BEGIN` is in flight leaves behind a
    /// dropped transaction, which rolls back and releases in the background.
    pub async fn begin(pool: &Pool<K>, isolation_level: Option<IsolationLevel>) -> DbResult<Self> {
        let guard = ConnectionGuard::acquire(pool).await?;
        let reserved = guard.reserve().await?;

        let tx = Self {
            id: generate_transaction_id(),
            pool: pool.clone(),
            conn: guard.detach(),
            reserved: Arc::new(reserved),
            finished: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        };

        if let Err(e) = open(tx.reserved.as_ref(), isolation_level).await {
            error!(transaction_id = %tx.id, error = %e, "Failed to begin transaction");
            tx.abandon().await;
            return Err(e);
        }

        info!(
            transaction_id = %tx.id,
            connection = tx.conn.id(),
            isolation_level = ?isolation_level,
            "Transaction started"
        );
        Ok(tx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &'static str {
        PROVIDER
    }

    pub fn adapter_name(&self) -> &'static str {
        ADAPTER_NAME
    }

    /// Transactions never emit a phantom `BEGIN` query on the caller's behalf.
    pub fn use_phantom_query(&self) -> bool {
        false
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether a statement in this transaction has failed.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Run a row-returning statement inside the transaction.
    pub async fn query_raw(&self, query: SqlQuery) -> DbResult<SqlResultSet> {
        let result = self.run(query).await?;
        Ok(shape_result(result))
    }

    /// Run a statement inside the transaction and return the affected row count.
    pub async fn execute_raw(&self, query: SqlQuery) -> DbResult<u64> {
        let result = self.run(query).await?;
        Ok(result.affected_count())
    }

    /// Commit, or roll back and fail if an earlier statement failed.
    pub async fn commit(&self) -> DbResult<()> {
        if self.is_aborted() {
            self.finish(Finish::Rollback).await?;
            warn!(transaction_id = %self.id, "Commit converted to rollback after failed statement");
            return Err(DbError::transaction_aborted(&self.id));
        }
        self.finish(Finish::Commit).await
    }

    /// Roll back. Calling this on a finished transaction does nothing.
    pub async fn rollback(&self) -> DbResult<()> {
        self.finish(Finish::Rollback).await
    }

    async fn run(&self, query: SqlQuery) -> DbResult<crate::db::client::NativeResult> {
        if self.is_finished() {
            return Err(DbError::transaction(
                "Transaction is already closed",
                &self.id,
            ));
        }

        match run_statement(self.reserved.as_ref(), &query.sql, query.args).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.aborted.store(true, Ordering::Release);
                error!(transaction_id = %self.id, error = %e, "Transaction query failed");
                Err(e)
            }
        }
    }

    /// Hand session and connection back without issuing any statement.
    async fn abandon(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.reserved.release().await;
            self.pool.release(self.conn.clone());
        }
    }

    async fn finish(&self, action: Finish) -> DbResult<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let outcome = match action {
            Finish::Commit => self
                .reserved
                .call(&single_fragment("COMMIT"), Vec::new())
                .await
                .map(|_| ()),
            Finish::Rollback => {
                if let Err(e) = self
                    .reserved
                    .call(&single_fragment("ROLLBACK"), Vec::new())
                    .await
                {
                    debug!(transaction_id = %self.id, error = %e, "Ignoring rollback failure");
                }
                Ok(())
            }
        };

        self.reserved.release().await;
        self.pool.release(self.conn.clone());

        match (&outcome, action) {
            (Ok(()), Finish::Commit) => {
                info!(transaction_id = %self.id, "Transaction committed")
            }
            (Ok(()), Finish::Rollback) => {
                info!(transaction_id = %self.id, "Transaction rolled back")
            }
            (Err(e), _) => {
                error!(transaction_id = %self.id, error = %e, "Transaction commit failed")
            }
        }
        outcome
    }
}

impl<K: Connector> Drop for Transaction<K> {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let pool = self.pool.clone();
        let conn = self.conn.clone();
        let reserved = Arc::clone(&self.reserved);
        let transaction_id = self.id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = reserved.call(&single_fragment("ROLLBACK"), Vec::new()).await;
                    reserved.release().await;
                    pool.release(conn);
                    warn!(
                        transaction_id = %transaction_id,
                        "Transaction rolled back via Drop - call commit() or rollback() explicitly"
                    );
                });
            }
            Err(_) => {
                // The session may still be inside BEGIN; it must not go back to the idle list.
                warn!(
                    transaction_id = %transaction_id,
                    connection = conn.id(),
                    "Transaction dropped outside a runtime; connection left checked out"
                );
            }
        }
    }
}

async fn open<R: TemplateExecutor + ?Sized>(
    reserved: &R,
    isolation_level: Option<IsolationLevel>,
) -> DbResult<()> {
    reserved.call(&single_fragment("BEGIN"), Vec::new()).await?;
    if let Some(level) = isolation_level {
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level);
        reserved.call(&single_fragment(&sql), Vec::new()).await?;
    }
    Ok(())
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
        assert_ne!(id, generate_transaction_id());
    }
}
