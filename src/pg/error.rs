//! Error types for the PostgreSQL client runtime.

use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
///
/// Variants fall into three scopes:
/// - connection-fatal (`Network`, `Protocol`, `ConnectionClosed`, `QueryTimeout`):
///   the connection is torn down and never returned to a pool's idle set;
/// - operation-scoped (`Server`, `Decode`, `Encode`): only the affected operation or field fails;
/// - caller/pool-scoped (`Auth`, `PoolTimeout`, `PoolClosed`, `CursorClosed`, `Config`).
#[derive(Debug, Error)]
pub enum PgError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Network(#[from] io::Error),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed during startup.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an error for one operation.
    #[error("{severity}: {message} ({code}){}{}", fmt_detail(.detail), fmt_hint(.hint))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<String>,
    },

    /// A single column value could not be decoded.
    #[error("Cannot decode column {column}: {message}")]
    Decode { column: usize, message: String },

    /// A message does not fit the wire format; nothing was sent.
    #[error("Cannot encode message: {0}")]
    Encode(String),

    /// Connection is closed or was closed while the operation was pending.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Per-query timeout elapsed; the connection was torn down.
    #[error("Query timed out")]
    QueryTimeout,

    /// No pool entry became available within the connection timeout.
    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The pool has been ended.
    #[error("Pool is closed")]
    PoolClosed,

    /// Cursor was read after being closed.
    #[error("Cursor is closed")]
    CursorClosed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_detail(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!("\nDetail: {}", d))
        .unwrap_or_default()
}

fn fmt_hint(hint: &Option<String>) -> String {
    hint.as_ref()
        .map(|h| format!("\nHint: {}", h))
        .unwrap_or_default()
}

impl PgError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Network(_)
                | PgError::Protocol(_)
                | PgError::ConnectionClosed
                | PgError::QueryTimeout
        )
    }

    /// SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Produce an equivalent error for another waiter.
    ///
    /// `io::Error` is not `Clone`, so fatal errors fanned out to queued
    /// operations degrade to `ConnectionClosed` after the first recipient.
    pub(crate) fn duplicate(&self) -> PgError {
        match self {
            PgError::Protocol(msg) => PgError::Protocol(msg.clone()),
            PgError::Auth(msg) => PgError::Auth(msg.clone()),
            PgError::QueryTimeout => PgError::QueryTimeout,
            _ => PgError::ConnectionClosed,
        }
    }
}
