//! PostgreSQL wire protocol client.
//!
//! Architecture:
//! - `protocol`: Frame encoding/decoding for both directions
//! - `types`: Value encoding/decoding and rows
//! - `statement`: Per-connection prepared statement cache
//! - `scram`: SCRAM-SHA-256 authentication
//! - `config`: Connection settings and the transport seam
//! - `connection`: One session's protocol state machine
//! - `client`: Queued operations over a connection task, with events
//! - `cursor`: Incremental reads through a portal
//! - `pool`: Bounded client pool with waiters, timeouts and leak detection

pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod types;

#[cfg(test)]
mod mock_server;

pub use client::{Client, ClientEvent, ClientState, ListenerId, Transaction};
pub use config::{Connect, PgConfig, SslMode, TcpConnector, Transport};
pub use connection::{PgConnection, QueryResult};
pub use cursor::{Cursor, CursorState};
pub use error::{PgError, PgResult};
pub use pool::{LeakReport, Pool, PoolConfig, PoolStatus, PooledClient};
pub use protocol::{Format, TransactionStatus};
pub use statement::{PreparedStatement, SharedColumns};
pub use types::{Oid, PgValue, Row};
