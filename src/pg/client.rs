//! Client: one connection, a FIFO operation queue and event listeners.
//!
//! Each connected `Client` owns a background task that holds the
//! [`PgConnection`]. Operations are queued on an unbounded channel and run
//! one at a time in submission order; each carries a oneshot slot that
//! receives its result exactly once.
//!
//! ```text
//!   query() ─┐
//!   query() ─┼─► [op queue] ─► worker task ─► PgConnection ─► Transport
//!   cursor ──┘                      │
//!                                   └─► listeners (notification/notice/error/end)
//! ```
//!
//! While no operation is running the task keeps reading the socket, so
//! notifications and a dropped connection are observed promptly.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::config::{Connect, PgConfig, TcpConnector};
use super::connection::{AsyncHook, AsyncMessage, PgConnection, PortalBatch, QueryResult};
use super::cursor::Cursor;
use super::error::{PgError, PgResult};
use super::protocol::TransactionStatus;
use super::statement::SharedColumns;
use super::types::PgValue;

/// Lifecycle of a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Authenticating,
    Idle,
    Querying,
    Ending,
}

/// Events delivered to client listeners.
#[derive(Debug)]
pub enum ClientEvent {
    /// LISTEN/NOTIFY message. An empty payload is reported as `None`.
    Notification {
        process_id: i32,
        channel: String,
        payload: Option<String>,
    },
    /// Server notice or warning.
    Notice {
        severity: String,
        code: String,
        message: String,
    },
    /// Connection-fatal error while no operation was pending.
    Error(PgError),
    /// The connection is gone.
    End,
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

type Reply<T> = oneshot::Sender<PgResult<T>>;

// ============================================================================
// Operations
// ============================================================================

/// A unit of work queued on a client.
pub(crate) enum Operation {
    Query {
        sql: String,
        params: Vec<PgValue>,
        statement: Option<String>,
        reply: Reply<QueryResult>,
    },
    SimpleQuery {
        sql: String,
        reply: Reply<Vec<QueryResult>>,
    },
    /// Runs even though nobody awaits the result.
    Detached { sql: String },
    /// Holds the connection until the cursor is exhausted, closed or dropped.
    Cursor {
        sql: String,
        params: Vec<PgValue>,
        rows: usize,
        requests: mpsc::UnboundedReceiver<CursorRequest>,
        reply: Reply<PortalBatch>,
    },
}

/// Commands from an open cursor to the worker serving it.
pub(crate) enum CursorRequest {
    Fetch { rows: usize, reply: Reply<PortalBatch> },
    Close { reply: Reply<()> },
}

impl Operation {
    fn sql(&self) -> &str {
        match self {
            Operation::Query { sql, .. }
            | Operation::SimpleQuery { sql, .. }
            | Operation::Detached { sql }
            | Operation::Cursor { sql, .. } => sql,
        }
    }

    /// The submitter stopped waiting before the operation was dispatched.
    fn is_withdrawn(&self) -> bool {
        match self {
            Operation::Query { reply, .. } => reply.is_closed(),
            Operation::SimpleQuery { reply, .. } => reply.is_closed(),
            Operation::Cursor { reply, .. } => reply.is_closed(),
            Operation::Detached { .. } => false,
        }
    }

    fn fail(self, err: PgError) {
        match self {
            Operation::Query { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::SimpleQuery { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::Cursor { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::Detached { sql } => {
                debug!(%sql, error = %err, "dropping detached statement");
            }
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// State visible to both the client handle and its worker task.
pub(crate) struct Shared {
    state: Mutex<ClientState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    last_query: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    parameters: Mutex<HashMap<String, String>>,
    process_id: AtomicI32,
    transaction_status: Mutex<TransactionStatus>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ClientState::Disconnected),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            last_query: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            parameters: Mutex::new(HashMap::new()),
            process_id: AtomicI32::new(0),
            transaction_status: Mutex::new(TransactionStatus::Idle),
        }
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Text of the most recently dispatched operation.
    pub(crate) fn last_query(&self) -> Option<String> {
        self.last_query.lock().clone()
    }

    fn begin_operation(&self, sql: &str) {
        self.set_state(ClientState::Querying);
        *self.last_query.lock() = Some(sql.to_string());
        *self.last_activity.lock() = Instant::now();
    }

    fn end_operation(&self, status: TransactionStatus) {
        let mut state = self.state.lock();
        if *state == ClientState::Querying {
            *state = ClientState::Idle;
        }
        *self.transaction_status.lock() = status;
        *self.last_activity.lock() = Instant::now();
    }

    /// Invoke every listener in registration order.
    ///
    /// The list is snapshotted first so listeners may add or remove
    /// listeners without deadlocking.
    fn emit(&self, event: &ClientEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn async_hook(self: &Arc<Self>) -> AsyncHook {
        let shared = Arc::clone(self);
        Box::new(move |msg| match msg {
            AsyncMessage::Notification {
                process_id,
                channel,
                payload,
            } => shared.emit(&ClientEvent::Notification {
                process_id,
                channel,
                payload: (!payload.is_empty()).then_some(payload),
            }),
            AsyncMessage::Notice {
                severity,
                code,
                message,
            } => shared.emit(&ClientEvent::Notice {
                severity,
                code,
                message,
            }),
            AsyncMessage::ParameterStatus { name, value } => {
                shared.parameters.lock().insert(name, value);
            }
        })
    }
}

// ============================================================================
// Client
// ============================================================================

struct Handle {
    ops: mpsc::UnboundedSender<Operation>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A PostgreSQL client owning one connection.
pub struct Client {
    config: PgConfig,
    connector: Arc<dyn Connect>,
    shared: Arc<Shared>,
    handle: Mutex<Option<Handle>>,
}

impl Client {
    /// Create a disconnected client using plain TCP.
    pub fn new(config: PgConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Create a disconnected client with a custom transport connector.
    pub fn with_connector(config: PgConfig, connector: Arc<dyn Connect>) -> Self {
        Self {
            config,
            connector,
            shared: Arc::new(Shared::new()),
            handle: Mutex::new(None),
        }
    }

    /// Open the transport, authenticate and start the connection task.
    ///
    /// Succeeds only once the server reports ready-for-query.
    pub async fn connect(&self) -> PgResult<()> {
        if self.shared.state() != ClientState::Disconnected {
            return Err(PgError::Config("Client is already connected".to_string()));
        }

        self.shared.set_state(ClientState::Connecting);
        let attempt = async {
            let transport = self.connector.connect(&self.config).await?;
            self.shared.set_state(ClientState::Authenticating);
            PgConnection::startup(transport, &self.config, self.shared.async_hook()).await
        };
        let result = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                Err(PgError::Network(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                )))
            }),
            None => attempt.await,
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                self.shared.set_state(ClientState::Disconnected);
                debug!(host = %self.config.host, error = %err, "connect failed");
                return Err(err);
            }
        };

        info!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            pid = conn.backend_pid(),
            "connected"
        );

        self.shared
            .process_id
            .store(conn.backend_pid(), Ordering::Relaxed);
        *self.shared.transaction_status.lock() = conn.transaction_status();
        self.shared.set_state(ClientState::Idle);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            conn,
            ops: ops_rx,
            shutdown: shutdown_rx,
            shared: Arc::clone(&self.shared),
            query_timeout: self.config.query_timeout,
        };
        let task = tokio::spawn(worker.run());

        *self.handle.lock() = Some(Handle {
            ops: ops_tx,
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Execute a query with the extended protocol.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.submit(|reply| Operation::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
            statement: None,
            reply,
        })
        .await
    }

    /// Execute a query as a named prepared statement.
    pub async fn query_named(
        &self,
        name: &str,
        sql: &str,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.submit(|reply| Operation::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
            statement: Some(name.to_string()),
            reply,
        })
        .await
    }

    /// Execute a statement and return the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(sql, params).await?.rows_affected())
    }

    /// Execute one or more statements with the simple query protocol.
    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.submit(|reply| Operation::SimpleQuery {
            sql: sql.to_string(),
            reply,
        })
        .await
    }

    pub async fn begin(&self) -> PgResult<()> {
        self.simple_query("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&self) -> PgResult<()> {
        self.simple_query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await.map(|_| ())
    }

    /// Start a transaction.
    ///
    /// The guard rolls back on drop unless committed or rolled back.
    pub async fn transaction(&self) -> PgResult<Transaction<'_>> {
        self.begin().await?;
        Ok(Transaction {
            client: self,
            finished: false,
        })
    }

    /// Create a cursor over `sql`; nothing is sent until the first read.
    ///
    /// While the cursor is open it occupies this client's operation slot:
    /// later operations queue behind it until it is exhausted or closed.
    pub fn cursor(&self, sql: &str, params: &[PgValue]) -> Cursor<'_> {
        Cursor::new(self, sql, params)
    }

    /// Register an event listener. Listeners run in registration order.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Send Terminate and stop the connection task.
    ///
    /// Does not wait for queued operations: the running one and everything
    /// queued behind it fail with `ConnectionClosed`. Resolves once the
    /// transport is closed.
    pub async fn end(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            if *state != ClientState::Disconnected {
                *state = ClientState::Ending;
            }
        }

        let _ = handle.shutdown.send(true);
        drop(handle.ops);
        if let Err(err) = handle.task.await {
            warn!(error = %err, "connection task failed");
        }
        self.shared.set_state(ClientState::Disconnected);
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// True once the connection is gone, whether ended or broken.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.shared.state(),
            ClientState::Disconnected | ClientState::Ending
        )
    }

    /// Get a server parameter reported via ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameters.lock().get(name).cloned()
    }

    /// Backend process ID.
    pub fn process_id(&self) -> i32 {
        self.shared.process_id.load(Ordering::Relaxed)
    }

    /// Transaction status as of the last completed operation.
    pub fn transaction_status(&self) -> TransactionStatus {
        *self.shared.transaction_status.lock()
    }

    /// Text of the most recently dispatched operation.
    pub fn last_query(&self) -> Option<String> {
        self.shared.last_query()
    }

    /// Time since the last operation was dispatched or completed.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Queue the operation that opens a cursor and fetches its first batch.
    pub(crate) async fn open_cursor(
        &self,
        sql: &str,
        params: &[PgValue],
        rows: usize,
        requests: mpsc::UnboundedReceiver<CursorRequest>,
    ) -> PgResult<PortalBatch> {
        self.submit(|reply| Operation::Cursor {
            sql: sql.to_string(),
            params: params.to_vec(),
            rows,
            requests,
            reply,
        })
        .await
    }

    fn enqueue(&self, op: Operation) -> PgResult<()> {
        let handle = self.handle.lock();
        let handle = handle.as_ref().ok_or(PgError::ConnectionClosed)?;
        handle
            .ops
            .send(op)
            .map_err(|_| PgError::ConnectionClosed)
    }

    async fn submit<T>(&self, build: impl FnOnce(Reply<T>) -> Operation) -> PgResult<T> {
        let (reply, result) = oneshot::channel();
        self.enqueue(build(reply))?;
        result.await.unwrap_or(Err(PgError::ConnectionClosed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("state", &self.state())
            .field("process_id", &self.process_id())
            .finish()
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// An open transaction on a client.
///
/// Dropped without `commit` or `rollback`, it queues a ROLLBACK; queue
/// ordering guarantees it runs before any later operation on the client.
pub struct Transaction<'c> {
    client: &'c Client,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.client.query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        self.client.execute(sql, params).await
    }

    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.client.simple_query(sql).await
    }

    pub fn cursor(&self, sql: &str, params: &[PgValue]) -> Cursor<'c> {
        self.client.cursor(sql, params)
    }

    pub async fn commit(mut self) -> PgResult<()> {
        self.finished = true;
        self.client.commit().await
    }

    pub async fn rollback(mut self) -> PgResult<()> {
        self.finished = true;
        self.client.rollback().await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("transaction dropped without commit, rolling back");
        if let Err(err) = self.client.enqueue(Operation::Detached {
            sql: "ROLLBACK".to_string(),
        }) {
            trace!(error = %err, "rollback not queued");
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Why the worker loop stopped.
enum Exit {
    /// `end()` was called or every client handle was dropped.
    Ended,
    /// The connection is unusable. `reported` is false when nobody has
    /// seen `error` yet.
    Broken { error: PgError, reported: bool },
}

/// Why a running operation stopped before completing.
enum Interrupt {
    Withdrawn,
    Shutdown,
    TimedOut,
}

struct Worker {
    conn: PgConnection,
    ops: mpsc::UnboundedReceiver<Operation>,
    shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
    query_timeout: Option<Duration>,
}

impl Worker {
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break Exit::Ended,
                op = self.ops.recv() => match op {
                    Some(op) => {
                        if let Err(exit) = self.dispatch(op).await {
                            break exit;
                        }
                    }
                    None => break Exit::Ended,
                },
                error = self.conn.wait_idle() => break Exit::Broken { error, reported: false },
            }
        };
        self.finish(exit).await;
    }

    async fn dispatch(&mut self, op: Operation) -> Result<(), Exit> {
        if op.is_withdrawn() {
            trace!(sql = op.sql(), "skipping withdrawn operation");
            return Ok(());
        }

        trace!(sql = op.sql(), "dispatching operation");
        self.shared.begin_operation(op.sql());

        let result = match op {
            Operation::Query {
                sql,
                params,
                statement,
                mut reply,
            } => {
                let outcome = supervise(
                    self.conn.query(&sql, &params, statement.as_deref()),
                    reply.closed(),
                    &mut self.shutdown,
                    self.query_timeout,
                )
                .await;
                settle(&self.shared, outcome, reply)
            }
            Operation::SimpleQuery { sql, mut reply } => {
                let outcome = supervise(
                    self.conn.simple_query(&sql),
                    reply.closed(),
                    &mut self.shutdown,
                    self.query_timeout,
                )
                .await;
                settle(&self.shared, outcome, reply)
            }
            Operation::Detached { sql } => {
                let outcome = supervise(
                    self.conn.simple_query(&sql),
                    std::future::pending(),
                    &mut self.shutdown,
                    self.query_timeout,
                )
                .await;
                match outcome {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) if err.is_fatal() => Err(Exit::Broken {
                        error: err,
                        reported: false,
                    }),
                    Ok(Err(err)) => {
                        warn!(%sql, error = %err, "detached statement failed");
                        Ok(())
                    }
                    Err(Interrupt::Shutdown) => Err(Exit::Ended),
                    Err(_) => Err(Exit::Broken {
                        error: PgError::QueryTimeout,
                        reported: false,
                    }),
                }
            }
            Operation::Cursor {
                sql,
                params,
                rows,
                requests,
                reply,
            } => self.serve_cursor(&sql, &params, rows, requests, reply).await,
        };

        self.shared.end_operation(self.conn.transaction_status());
        result
    }

    /// Open a portal, then serve fetches until it completes or is closed.
    async fn serve_cursor(
        &mut self,
        sql: &str,
        params: &[PgValue],
        rows: usize,
        mut requests: mpsc::UnboundedReceiver<CursorRequest>,
        mut reply: Reply<PortalBatch>,
    ) -> Result<(), Exit> {
        let portal = self.conn.next_portal_name();

        let conn = &mut self.conn;
        let opening = async {
            let columns = conn.open_portal(&portal, sql, params).await?;
            let batch = conn.fetch_portal(&portal, &columns, rows).await?;
            Ok::<_, PgError>((columns, batch))
        };
        let outcome = supervise(
            opening,
            reply.closed(),
            &mut self.shutdown,
            self.query_timeout,
        )
        .await;

        let columns: SharedColumns = match outcome {
            Ok(Ok((columns, batch))) => {
                let done = batch.done;
                let _ = reply.send(Ok(batch));
                if done {
                    return Ok(());
                }
                columns
            }
            other => return settle(&self.shared, other.map(|r| r.map(|(_, b)| b)), reply),
        };

        loop {
            let request = tokio::select! {
                request = requests.recv() => request,
                _ = self.shutdown.changed() => return Err(Exit::Ended),
            };

            match request {
                Some(CursorRequest::Fetch { rows, mut reply }) => {
                    let outcome = supervise(
                        self.conn.fetch_portal(&portal, &columns, rows),
                        reply.closed(),
                        &mut self.shutdown,
                        self.query_timeout,
                    )
                    .await;
                    let finished = !matches!(outcome, Ok(Ok(PortalBatch { done: false, .. })));
                    settle(&self.shared, outcome, reply)?;
                    if finished {
                        return Ok(());
                    }
                }
                Some(CursorRequest::Close { reply }) => {
                    let result = self.conn.close_portal(&portal).await;
                    return settle(&self.shared, Ok(result), reply);
                }
                None => {
                    trace!(%portal, "cursor dropped, closing portal");
                    return match self.conn.close_portal(&portal).await {
                        Err(err) if err.is_fatal() => Err(Exit::Broken {
                            error: err,
                            reported: false,
                        }),
                        _ => Ok(()),
                    };
                }
            }
        }
    }

    async fn finish(mut self, exit: Exit) {
        self.ops.close();

        let (queued_error, event) = match exit {
            Exit::Ended => {
                debug!(pid = self.conn.backend_pid(), "ending connection");
                (PgError::ConnectionClosed, None)
            }
            Exit::Broken { error, reported } => {
                warn!(pid = self.conn.backend_pid(), error = %error, "connection failed");
                if reported {
                    (error, None)
                } else {
                    (error.duplicate(), Some(error))
                }
            }
        };

        if let Err(err) = self.conn.close().await {
            trace!(error = %err, "terminate not delivered");
        }
        self.shared.set_state(ClientState::Disconnected);

        while let Ok(op) = self.ops.try_recv() {
            op.fail(queued_error.duplicate());
        }

        if let Some(error) = event {
            self.shared.emit(&ClientEvent::Error(error));
        }
        self.shared.emit(&ClientEvent::End);
        debug!(pid = self.conn.backend_pid(), "connection closed");
    }
}

/// Run `work` until it completes, its caller withdraws, the client is ended
/// or the per-query timeout elapses.
async fn supervise<T>(
    work: impl Future<Output = PgResult<T>>,
    withdrawn: impl Future<Output = ()>,
    shutdown: &mut watch::Receiver<bool>,
    limit: Option<Duration>,
) -> Result<PgResult<T>, Interrupt> {
    let deadline = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = work => Ok(result),
        _ = withdrawn => Err(Interrupt::Withdrawn),
        _ = shutdown.changed() => Err(Interrupt::Shutdown),
        _ = deadline => Err(Interrupt::TimedOut),
    }
}

/// Deliver an operation's outcome. Connection-fatal outcomes stop the worker.
///
/// A partially completed exchange cannot be resumed, so any interruption of
/// a running operation tears the connection down.
fn settle<T>(
    shared: &Shared,
    outcome: Result<PgResult<T>, Interrupt>,
    reply: Reply<T>,
) -> Result<(), Exit> {
    match outcome {
        Ok(Ok(value)) => {
            let _ = reply.send(Ok(value));
            Ok(())
        }
        Ok(Err(err)) if err.is_fatal() => {
            shared.set_state(ClientState::Disconnected);
            let rest = err.duplicate();
            let _ = reply.send(Err(err));
            Err(Exit::Broken {
                error: rest,
                reported: true,
            })
        }
        Ok(Err(err)) => {
            let _ = reply.send(Err(err));
            Ok(())
        }
        Err(Interrupt::TimedOut) => {
            shared.set_state(ClientState::Disconnected);
            let _ = reply.send(Err(PgError::QueryTimeout));
            Err(Exit::Broken {
                error: PgError::ConnectionClosed,
                reported: true,
            })
        }
        Err(Interrupt::Withdrawn) => {
            shared.set_state(ClientState::Disconnected);
            Err(Exit::Broken {
                error: PgError::ConnectionClosed,
                reported: true,
            })
        }
        Err(Interrupt::Shutdown) => {
            let _ = reply.send(Err(PgError::ConnectionClosed));
            Err(Exit::Ended)
        }
    }
}
