//! Physical connection establishment.
//!
//! Opens one connection by trying each normalized connection-string candidate in
//! order, warming it with `SELECT 1` and applying the requested `search_path`.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::client::{Connector, NativeClient, TemplateExecutor, single_fragment};
use crate::db::conn_string::{connection_candidates, mask_credentials, schema_param};
use crate::error::{DbError, DbResult};

/// Error reported when every candidate failed to parse as a connection URL.
pub const INVALID_URL_MESSAGE: &str = "Invalid DATABASE_URL/connectionString. Check URL shape; credentials are auto-encoded by the adapter.";

/// Creates warmed physical connections for the pool.
pub struct ConnectionFactory<K: Connector> {
    connector: Arc<K>,
    candidates: Vec<String>,
    search_path: Option<String>,
}

impl<K: Connector> ConnectionFactory<K> {
    /// Create a factory for `connection_string`. No I/O happens until [`open`](Self::open).
    pub fn new(connector: K, connection_string: &str) -> Self {
        Self {
            connector: Arc::new(connector),
            candidates: connection_candidates(connection_string),
            search_path: schema_param(connection_string),
        }
    }

    /// The underlying connector.
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Connection strings tried, in order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Open one warmed connection.
    ///
    /// Authentication failures and unparseable candidates move on to the next
    /// candidate; any other error is returned immediately.
    pub async fn open(&self) -> DbResult<K::Client> {
        let mut last_err: Option<DbError> = None;

        for candidate in &self.candidates {
            debug!(candidate = %mask_credentials(candidate), "Trying connection candidate");
            match self.try_candidate(candidate).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_auth_failure() || e.is_invalid_connection_string() => {
                    debug!(error = %e, "Connection candidate rejected");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_err {
            Some(e) if e.is_invalid_connection_string() => {
                warn!(error = %e, "No connection candidate could be parsed");
                Err(DbError::invalid_connection_string(INVALID_URL_MESSAGE))
            }
            Some(e) => Err(e),
            None => Err(DbError::connection(
                "Failed to establish Postgres connection",
                "Provide a non-empty connection string",
            )),
        }
    }

    async fn try_candidate(&self, candidate: &str) -> DbResult<K::Client> {
        let client = self.connector.connect(candidate).await?;
        if let Err(e) = self.warm_up(&client).await {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    async fn warm_up(&self, client: &K::Client) -> DbResult<()> {
        client.call(&single_fragment("SELECT 1"), Vec::new()).await?;
        if let Some(schema) = &self.search_path {
            let set_path = format!("SET search_path TO {}", quote_identifier(schema));
            client.call(&single_fragment(&set_path), Vec::new()).await?;
        }
        Ok(())
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
