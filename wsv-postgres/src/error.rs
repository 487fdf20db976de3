//! Error types for PostgreSQL storage bootstrap and failover.

use thiserror::Error;

/// Result type for PostgreSQL storage operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while bootstrapping or using the session pool.
///
/// Driver errors never cross this boundary untouched: they are converted into
/// sanitized, single-line messages where they originate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PgError {
    /// Invalid connection options or pool parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// Settings file could not be read or parsed.
    #[error("settings error: {0}")]
    Settings(String),

    /// Database creation or catalog query failed.
    #[error("{0}")]
    Schema(String),

    /// One of the pool sessions could not be opened.
    #[error("pool initialization failed: {0}")]
    PoolInit(String),

    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("query error: {0}")]
    Query(String),

    /// Rolling back a dangling prepared transaction failed.
    #[error("prepared transaction rollback failed: {0}")]
    Recovery(String),

    /// The reconnection strategy refused further attempts for a session.
    #[error("session {slot} is permanently failed after {attempts} reconnection attempt(s)")]
    ReconnectExhausted {
        /// Pool slot of the failed session.
        slot: usize,
        /// Number of reconnection attempts made over the session's lifetime.
        attempts: u32,
    },

    /// Timeout error.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Create a schema error from a driver failure.
    pub fn schema(message: impl AsRef<str>) -> Self {
        Self::Schema(format!(
            "Connection to PostgreSQL broken: {}",
            sanitize_message(message.as_ref())
        ))
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::PoolInit(_) | Self::ReconnectExhausted { .. }
        )
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if the failed operation may succeed when repeated.
    ///
    /// A permanently failed session or a closed pool never recovers.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            Self::Connection(describe(&err))
        } else {
            Self::Query(describe(&err))
        }
    }
}

/// Render a driver error as a sanitized single line, including the server's
/// message when one was reported.
pub(crate) fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => sanitize_message(&format!("{}: {}", db.severity(), db.message())),
        None => sanitize_message(&err.to_string()),
    }
}

/// Collapse control characters into spaces so a driver or server message
/// always fits on one log line.
pub fn sanitize_message(message: &str) -> String {
    message
        .trim_end()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}
