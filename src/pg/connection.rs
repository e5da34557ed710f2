//! PostgreSQL connection implementation.
//!
//! One protocol session over a [`Transport`]:
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended query protocols
//! - Prepared statement management
//! - Named portals for incremental fetches
//!
//! A `PgConnection` is driven by exactly one task at a time; the `Client`
//! layer is responsible for serializing operations onto it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use super::config::{PgConfig, Transport};
use super::error::{PgError, PgResult};
use super::protocol::*;
use super::scram::{self, ScramClient};
use super::statement::{PreparedStatement, SharedColumns, StatementCache};
use super::types::{Oid, PgValue, Row};

// ============================================================================
// Query Result
// ============================================================================

/// Result of a query execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column descriptions, shared with every row.
    pub columns: SharedColumns,
    /// Row data
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    /// Number of rows affected, parsed from the command tag.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }
}

/// Parse rows affected from a PostgreSQL command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    // Common formats:
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3" -> 3 rows
    // - "SELECT 10" -> 10 rows
    // - "MOVE 2", "FETCH 2", "COPY 7" -> count last

    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["MOVE", n]
        | ["FETCH", n]
        | ["COPY", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

/// One batch of rows fetched from a portal.
#[derive(Debug)]
pub(crate) struct PortalBatch {
    pub rows: Vec<Row>,
    /// The portal ran to completion and has been closed.
    pub done: bool,
}

// ============================================================================
// Asynchronous messages
// ============================================================================

/// Messages the server may send outside of any request/response exchange.
#[derive(Debug, Clone)]
pub(crate) enum AsyncMessage {
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
    Notice {
        severity: String,
        code: String,
        message: String,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
}

/// Receives asynchronous messages as soon as their frame is decoded.
pub(crate) type AsyncHook = Box<dyn Fn(AsyncMessage) + Send + Sync>;

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: ReadHalf<Box<dyn Transport>>,
    writer: BufWriter<WriteHalf<Box<dyn Transport>>>,
    /// Prepared statement cache
    statement_cache: StatementCache,
    /// Statements evicted from the cache, closed with the next synced batch
    pending_closes: Vec<String>,
    /// Current transaction status
    transaction_status: TransactionStatus,
    /// Backend process ID
    backend_pid: i32,
    /// Backend secret key (for cancellation)
    backend_secret_key: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    /// Whether the connection is closed
    closed: bool,
    /// Whether `close` has run; the transport is shut down exactly once
    terminated: bool,
    /// Read buffer for incoming messages
    read_buffer: BytesMut,
    next_portal_id: u32,
    on_async: AsyncHook,
}

impl PgConnection {
    /// Run the startup handshake over an already-open transport.
    ///
    /// Succeeds only once the server reports ReadyForQuery.
    pub(crate) async fn startup(
        transport: Box<dyn Transport>,
        config: &PgConfig,
        on_async: AsyncHook,
    ) -> PgResult<Self> {
        let (read_half, write_half) = tokio::io::split(transport);

        let mut conn = Self {
            reader: read_half,
            writer: BufWriter::new(write_half),
            statement_cache: StatementCache::new(config.statement_cache_capacity),
            pending_closes: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            closed: false,
            terminated: false,
            read_buffer: BytesMut::with_capacity(32768), // 32KB buffer for better throughput
            next_portal_id: 0,
            on_async,
        };

        conn.handshake(config).await?;
        Ok(conn)
    }

    async fn handshake(&mut self, config: &PgConfig) -> PgResult<()> {
        let startup = StartupMessage {
            user: config.user.clone(),
            database: Some(config.database.clone()),
            options: config.startup_options(),
        };
        self.send_message(startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {
                    debug!(user = %config.user, "authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    debug!("using cleartext password authentication");
                    let password = required_password(config)?;
                    self.send_message(PasswordMessage::password(password))
                        .await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    debug!("using md5 password authentication");
                    let password = required_password(config)?;
                    let hash = md5_password(&config.user, password, &salt);
                    self.send_message(PasswordMessage::password(&hash)).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    debug!("using {} authentication", scram::MECHANISM);
                    let password = required_password(config)?;
                    self.authenticate_scram(&config.user, password).await?;
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, user: &str, password: &str) -> PgResult<()> {
        let mut scram = ScramClient::new(user, password);
        let client_first = scram.client_first_message();
        self.send_message(PasswordMessage::sasl_initial(scram::MECHANISM, &client_first))
            .await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send_message(PasswordMessage::sasl_response(&client_final))
                        .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(startup_error(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during SASL exchange: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Execute a simple query (text protocol).
    ///
    /// Returns one result per statement in the batch. Use for DDL,
    /// transaction control, or one-off queries.
    pub async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.ensure_open()?;

        self.buffer_pending_closes().await?;
        self.send_message(QueryMessage {
            query: query.to_string(),
        })
        .await?;

        let mut results = Vec::new();
        let mut current = QueryResult::new(Arc::new(Vec::new()));
        let mut error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current.columns = Arc::new(fields);
                }
                BackendMessage::DataRow { values } => {
                    let row = Row::new(Arc::clone(&current.columns), values);
                    current.rows.push(row);
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(current);
                    current = QueryResult::new(Arc::new(Vec::new()));
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(QueryResult::new(Arc::new(Vec::new())));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match error {
                        Some(err) => Err(err),
                        None => Ok(results),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    // The rest of the batch is skipped; ReadyForQuery follows.
                    error = Some(error_from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    /// Execute a query with the extended protocol (binary format).
    ///
    /// The statement is prepared once per distinct SQL text and cached. An
    /// explicit `statement_name` is used instead of a generated one.
    pub async fn query(
        &mut self,
        query: &str,
        params: &[PgValue],
        statement_name: Option<&str>,
    ) -> PgResult<QueryResult> {
        self.ensure_open()?;
        check_count("parameters", params.len())?;

        let stmt = match self.statement_cache.get(query) {
            Some(cached) if statement_name.map_or(true, |name| name == cached.name) => cached,
            _ => {
                let param_types: Vec<Oid> = params.iter().map(|p| p.type_oid()).collect();
                self.prepare(query, &param_types, statement_name).await?
            }
        };

        self.execute(&stmt, params).await
    }

    /// Prepare a statement explicitly and cache it.
    pub async fn prepare(
        &mut self,
        query: &str,
        param_types: &[Oid],
        statement_name: Option<&str>,
    ) -> PgResult<Arc<PreparedStatement>> {
        self.ensure_open()?;
        check_count("parameter types", param_types.len())?;

        // A statement with the same text under another name is replaced.
        if let Some(previous) = self.statement_cache.remove(query) {
            self.pending_closes.push(previous.name.clone());
        }

        let name = match statement_name {
            Some(name) => name.to_string(),
            None => self.statement_cache.next_statement_name(),
        };

        self.buffer_pending_closes().await?;
        self.buffer_message(ParseMessage {
            name: name.clone(),
            query: query.to_string(),
            param_types: param_types.to_vec(),
        })
        .await?;
        self.buffer_message(DescribeMessage {
            target: Target::Statement,
            name: name.clone(),
        })
        .await?;
        self.send_message(FrontendMessage::Sync).await?;

        let mut stmt = PreparedStatement::new(name, query.to_string());
        stmt.set_param_types(param_types.to_vec());
        let mut error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::ParameterDescription { type_oids } => {
                    stmt.set_param_types(type_oids);
                }
                BackendMessage::RowDescription { fields } => {
                    stmt.set_columns(fields);
                }
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(error_from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    if let Some(err) = error {
                        return Err(err);
                    }

                    let stmt = Arc::new(stmt);
                    if let Some(evicted) = self.statement_cache.insert(Arc::clone(&stmt)) {
                        trace!(statement = %evicted.name, "evicting prepared statement");
                        self.pending_closes.push(evicted.name.clone());
                    }
                    return Ok(stmt);
                }
                // ParseComplete, NoData, CloseComplete for pending closes
                _ => {}
            }
        }
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &mut self,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.ensure_open()?;
        check_count("parameters", params.len())?;

        // Pipeline: Bind + Execute + Sync in single flush
        self.buffer_message(bind_message("", &stmt.name, params))
            .await?;
        self.buffer_message(ExecuteMessage {
            portal: String::new(),
            max_rows: 0, // No limit
        })
        .await?;
        self.send_message(FrontendMessage::Sync).await?;

        let mut result = QueryResult::new(Arc::clone(&stmt.columns));
        let mut error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::DataRow { values } => {
                    result.rows.push(Row::new(Arc::clone(&stmt.columns), values));
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = tag;
                }
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(error_from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match error {
                        Some(err) => Err(err),
                        None => Ok(result),
                    };
                }
                _ => {}
            }
        }
    }

    // ========================================================================
    // Portals
    // ========================================================================

    /// Generate a unique portal name for this connection.
    pub(crate) fn next_portal_name(&mut self) -> String {
        self.next_portal_id = self.next_portal_id.wrapping_add(1);
        format!("__pgpipe_portal_{}", self.next_portal_id)
    }

    /// Parse and bind `query` into the named portal, returning its columns.
    ///
    /// The exchange ends with Flush rather than Sync so the portal survives
    /// until it is exhausted or closed. On error the connection is synced
    /// back to ReadyForQuery before returning.
    pub(crate) async fn open_portal(
        &mut self,
        portal: &str,
        query: &str,
        params: &[PgValue],
    ) -> PgResult<SharedColumns> {
        self.ensure_open()?;
        check_count("parameters", params.len())?;

        let param_types: Vec<Oid> = params.iter().map(|p| p.type_oid()).collect();
        self.buffer_message(ParseMessage {
            name: String::new(),
            query: query.to_string(),
            param_types,
        })
        .await?;
        self.buffer_message(bind_message(portal, "", params)).await?;
        self.buffer_message(DescribeMessage {
            target: Target::Portal,
            name: portal.to_string(),
        })
        .await?;
        self.send_message(FrontendMessage::Flush).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
                BackendMessage::RowDescription { fields } => return Ok(Arc::new(fields)),
                BackendMessage::NoData => return Ok(Arc::new(Vec::new())),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(self.recover(error_from_fields(&fields)).await);
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Fetch up to `max_rows` rows from an open portal.
    ///
    /// When the portal completes it is closed and the connection synced, so
    /// a batch with `done` set leaves the connection ready for the next
    /// operation.
    pub(crate) async fn fetch_portal(
        &mut self,
        portal: &str,
        columns: &SharedColumns,
        max_rows: usize,
    ) -> PgResult<PortalBatch> {
        self.ensure_open()?;

        self.buffer_message(ExecuteMessage {
            portal: portal.to_string(),
            max_rows: i32::try_from(max_rows).unwrap_or(i32::MAX),
        })
        .await?;
        self.send_message(FrontendMessage::Flush).await?;

        let mut rows = Vec::new();
        loop {
            match self.receive_message().await? {
                BackendMessage::DataRow { values } => {
                    rows.push(Row::new(Arc::clone(columns), values));
                }
                BackendMessage::PortalSuspended => {
                    return Ok(PortalBatch { rows, done: false });
                }
                BackendMessage::CommandComplete { .. } | BackendMessage::EmptyQueryResponse => {
                    self.close_portal(portal).await?;
                    return Ok(PortalBatch { rows, done: true });
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(self.recover(error_from_fields(&fields)).await);
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Close a portal and sync back to ReadyForQuery.
    pub(crate) async fn close_portal(&mut self, portal: &str) -> PgResult<()> {
        self.ensure_open()?;

        self.buffer_message(CloseMessage {
            target: Target::Portal,
            name: portal.to_string(),
        })
        .await?;
        self.send_message(FrontendMessage::Sync).await?;

        let mut error = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(error_from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return error.map_or(Ok(()), Err);
                }
                _ => {}
            }
        }
    }

    /// After an error inside an unsynced exchange: Sync and drain.
    ///
    /// Returns the error to report, which becomes the transport error if the
    /// drain itself fails.
    async fn recover(&mut self, err: PgError) -> PgError {
        if let Err(fatal) = self.send_message(FrontendMessage::Sync).await {
            return fatal;
        }
        match self.drain_until_ready().await {
            Ok(()) => err,
            Err(fatal) => fatal,
        }
    }

    // ========================================================================
    // Idle
    // ========================================================================

    /// Wait for traffic while no operation is running.
    ///
    /// Asynchronous messages are dispatched as they arrive; this only
    /// returns when the connection fails or the server sends something
    /// that has no place outside an exchange. Cancel-safe.
    pub(crate) async fn wait_idle(&mut self) -> PgError {
        match self.receive_message().await {
            Ok(BackendMessage::ErrorResponse { fields }) => {
                // e.g. FATAL 57P01 on administrator shutdown
                self.closed = true;
                error_from_fields(&fields)
            }
            Ok(other) => unexpected(other),
            Err(err) => err,
        }
    }

    /// Send Terminate and shut the transport down.
    ///
    /// A connection the server already dropped skips Terminate but is
    /// still shut down.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        let terminate = if self.closed {
            Ok(())
        } else {
            self.send_message(FrontendMessage::Terminate).await
        };
        self.closed = true;
        let shutdown = self.writer.shutdown().await;
        terminate?;
        shutdown?;
        Ok(())
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    /// Get a reference to the statement cache.
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statement_cache
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    /// Queue Close messages for evicted statements ahead of the next batch.
    async fn buffer_pending_closes(&mut self) -> PgResult<()> {
        for name in std::mem::take(&mut self.pending_closes) {
            self.buffer_message(CloseMessage {
                target: Target::Statement,
                name,
            })
            .await?;
        }
        Ok(())
    }

    /// Send a frontend message (with flush).
    async fn send_message(&mut self, msg: impl Into<FrontendMessage>) -> PgResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    /// Buffer a frontend message without flushing (for pipelining).
    #[inline]
    async fn buffer_message(&mut self, msg: impl Into<FrontendMessage>) -> PgResult<()> {
        let msg = msg.into();
        msg.check()?;
        let encoded = msg.to_bytes();
        self.writer.write_all(&encoded).await?;
        Ok(())
    }

    /// Flush buffered messages.
    #[inline]
    async fn flush(&mut self) -> PgResult<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next backend message that belongs to an exchange.
    ///
    /// Notifications, notices and parameter updates are handed to the async
    /// hook instead of being returned. Cancel-safe: a partially received
    /// frame stays in `read_buffer`.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            while let Some(msg) = BackendMessage::decode(&mut self.read_buffer)? {
                if let Some(msg) = self.dispatch_async(msg) {
                    return Ok(msg);
                }
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                self.closed = true;
                return Err(PgError::ConnectionClosed);
            }
        }
    }

    fn dispatch_async(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                trace!(%channel, "notification");
                (self.on_async)(AsyncMessage::Notification {
                    process_id,
                    channel,
                    payload,
                });
                None
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = AsyncMessage::Notice {
                    severity: fields.get(&b'S').cloned().unwrap_or_default(),
                    code: fields.get(&b'C').cloned().unwrap_or_default(),
                    message: fields.get(&b'M').cloned().unwrap_or_default(),
                };
                debug!(notice = ?notice, "server notice");
                (self.on_async)(notice);
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name.clone(), value.clone());
                (self.on_async)(AsyncMessage::ParameterStatus { name, value });
                None
            }
            other => Some(other),
        }
    }

    /// Drain messages until ReadyForQuery (after error).
    async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive_message().await? {
                self.transaction_status = status;
                return Ok(());
            }
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn bind_message(portal: &str, statement: &str, params: &[PgValue]) -> BindMessage {
    BindMessage {
        portal: portal.to_string(),
        statement: statement.to_string(),
        param_formats: vec![Format::Binary; params.len()],
        params: params.iter().map(|p| p.to_param()).collect::<Vec<Option<Bytes>>>(),
        result_formats: vec![Format::Binary],
    }
}

fn required_password(config: &PgConfig) -> PgResult<&str> {
    config
        .password
        .as_deref()
        .ok_or_else(|| PgError::Auth("Password required".to_string()))
}

/// Errors before ReadyForQuery: invalid credentials are authentication
/// failures, anything else is reported as the server sent it.
fn startup_error(fields: &HashMap<u8, String>) -> PgError {
    match fields.get(&b'C').map(String::as_str) {
        // invalid_authorization_specification, invalid_password
        Some("28000") | Some("28P01") => PgError::Auth(
            fields
                .get(&b'M')
                .cloned()
                .unwrap_or_else(|| "authentication failed".to_string()),
        ),
        _ => error_from_fields(fields),
    }
}

fn unexpected(msg: BackendMessage) -> PgError {
    PgError::Protocol(format!("Unexpected message: {:?}", msg))
}

/// Compute MD5 password hash.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Convert inner hash to hex string, then append salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}
