//! Adapter error type.
//!
//! Failures while opening a connection carry a hint for the operator. Statement
//! failures are reported as the server phrased them, after the connection has
//! gone back to the pool.

use thiserror::Error;

/// SQLSTATE `invalid_password`.
const INVALID_PASSWORD: &str = "28P01";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Could not reach the database: {message}")]
    Connection { message: String, hint: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Invalid connection string: {message}")]
    InvalidConnectionString { message: String },

    #[error("Query failed: {message}")]
    Database {
        message: String,
        /// Five-character SQLSTATE reported by the server.
        code: Option<String>,
        hint: String,
    },

    #[error("Adapter disposed")]
    PoolDisposed,

    #[error("Transaction {transaction_id}: {message}")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Transaction rolled back due to a previous error (transaction: {transaction_id})")]
    TransactionAborted { transaction_id: String },

    #[error("{message}")]
    Internal { message: String },
}

impl DbError {
    pub fn connection(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn invalid_connection_string(message: impl Into<String>) -> Self {
        Self::InvalidConnectionString {
            message: message.into(),
        }
    }

    /// A statement rejected by the server, with its SQLSTATE when known.
    pub fn database(
        message: impl Into<String>,
        code: Option<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            code,
            hint: hint.into(),
        }
    }

    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn transaction_aborted(transaction_id: impl Into<String>) -> Self {
        Self::TransactionAborted {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Operator-facing hint printed next to the error, if there is one.
    pub fn suggestion(&self) -> Option<&str> {
        let hint = match self {
            Self::Connection { hint, .. } | Self::Database { hint, .. } => hint.as_str(),
            Self::Authentication { .. } => "Verify the username and password in the connection string",
            Self::InvalidConnectionString { .. } => {
                "Check the URL shape; credentials are percent-encoded by the adapter automatically"
            }
            _ => return None,
        };
        Some(hint)
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn is_invalid_connection_string(&self) -> bool {
        matches!(self, Self::InvalidConnectionString { .. })
    }

    /// SQLSTATE of a server-side statement failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Servers that reject a password before the startup handshake completes
/// surface it as plain text rather than a structured error.
fn mentions_bad_password(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("password authentication failed") || lower.contains("28p01")
}

fn from_server(err: &dyn sqlx::error::DatabaseError) -> DbError {
    let code = err.code().map(|c| c.into_owned());
    if code.as_deref() == Some(INVALID_PASSWORD) || mentions_bad_password(err.message()) {
        return DbError::authentication(err.message());
    }
    DbError::database(
        err.message(),
        code,
        "Inspect the statement and the objects it references",
    )
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        match err {
            E::Database(server) => from_server(server.as_ref()),
            E::Configuration(reason) => Self::invalid_connection_string(reason.to_string()),
            E::Protocol(reason) if mentions_bad_password(&reason) => Self::authentication(reason),
            E::Protocol(reason) => Self::connection(
                format!("unexpected reply from server ({reason})"),
                "Make sure the server speaks the PostgreSQL wire protocol",
            ),
            E::Io(io) => Self::connection(
                io.to_string(),
                "Confirm the host and port are reachable and the server is running",
            ),
            E::Tls(tls) => Self::connection(
                format!("TLS handshake: {tls}"),
                "Review the sslmode and certificate settings",
            ),
            E::PoolClosed => Self::PoolDisposed,
            E::RowNotFound => Self::database("statement returned no rows", None, "none"),
            E::ColumnDecode { index, source } => {
                Self::internal(format!("column {index} could not be decoded: {source}"))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
