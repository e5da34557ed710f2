//! Scripted in-process PostgreSQL backend for tests.
//!
//! Speaks the real wire protocol over `tokio::io::duplex`, using the crate's
//! own codec in the server direction. It understands a small SQL dialect:
//!
//! | SQL | Behaviour |
//! |---|---|
//! | `SELECT generate_series(1, N)` | N int4 rows |
//! | `SELECT pg_sleep(S)` | sleeps S seconds, one row |
//! | `SELECT $1` | echoes the first parameter |
//! | `SELECT <int>` | one int4 row |
//! | `SELECT * FROM missing` | ERROR 42P01 |
//! | `NOTIFY chan[, 'payload']` | notification to the session itself |
//! | `NOTICE <text>` | NoticeResponse |
//! | `DISCONNECT` | drops the socket |
//! | `GARBAGE` | sends a frame with an invalid length |
//! | `BEGIN` / `COMMIT` / `ROLLBACK` | transaction status tracking |
//! | anything else | CommandComplete with a plausible tag |

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

use super::client::Client;
use super::config::{Connect, PgConfig, Transport};
use super::connection::md5_password;
use super::protocol::*;
use super::scram;
use super::types::Oid;

const SALT: [u8; 4] = [1, 2, 3, 4];
const SCRAM_SALT: &[u8] = b"mock-server-salt";
const SCRAM_ITERATIONS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMethod {
    Trust,
    Cleartext,
    Md5,
    Scram,
}

#[derive(Debug, Clone)]
enum Push {
    Notify { channel: String, payload: String },
    Drop,
}

struct MockState {
    auth: AuthMethod,
    password: String,
    next_pid: AtomicI32,
    active: AtomicUsize,
    opened: AtomicUsize,
    refuse: AtomicBool,
    executed: Mutex<Vec<String>>,
    closed_statements: Mutex<Vec<String>>,
    pushes: broadcast::Sender<Push>,
}

/// Handle to a mock backend; clones share the same server.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_auth(AuthMethod::Trust, "secret")
    }

    pub fn with_auth(auth: AuthMethod, password: &str) -> Self {
        let (pushes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(MockState {
                auth,
                password: password.to_string(),
                next_pid: AtomicI32::new(1000),
                active: AtomicUsize::new(0),
                opened: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                executed: Mutex::new(Vec::new()),
                closed_statements: Mutex::new(Vec::new()),
                pushes,
            }),
        }
    }

    /// Client configuration matching this server.
    pub fn config(&self) -> PgConfig {
        PgConfig::new()
            .host("mock")
            .user("tester")
            .password(&self.state.password)
            .database("mockdb")
    }

    pub fn connector(&self) -> Arc<dyn Connect> {
        Arc::new(self.clone())
    }

    pub fn client(&self) -> Client {
        self.client_with(self.config())
    }

    pub fn client_with(&self, config: PgConfig) -> Client {
        Client::with_connector(config, self.connector())
    }

    /// A connected client.
    pub async fn connected(&self) -> Client {
        let client = self.client();
        client.connect().await.expect("mock connect");
        client
    }

    /// SQL text of every statement executed, in order, across sessions.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// Names of prepared statements closed by clients.
    pub fn closed_statements(&self) -> Vec<String> {
        self.state.closed_statements.lock().clone()
    }

    /// Send a notification to every session.
    pub fn notify(&self, channel: &str, payload: &str) {
        let _ = self.state.pushes.send(Push::Notify {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Abruptly close every idle session.
    pub fn drop_connections(&self) {
        let _ = self.state.pushes.send(Push::Drop);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn opened_connections(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connect for MockServer {
    async fn connect(&self, _config: &PgConfig) -> io::Result<Box<dyn Transport>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }

        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let pid = self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        let pushes = self.state.pushes.subscribe();
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.active.fetch_add(1, Ordering::SeqCst);

        let session = Session {
            stream: server_side,
            input: BytesMut::new(),
            output: BytesMut::new(),
            state: Arc::clone(&self.state),
            pid,
            statements: HashMap::new(),
            portals: HashMap::new(),
            status: TransactionStatus::Idle,
            skipping: false,
        };
        tokio::spawn(session.run(pushes));

        Ok(Box::new(client_side))
    }
}

// ============================================================================
// Query plans
// ============================================================================

#[derive(Debug, Clone)]
struct Cell {
    binary: Bytes,
    text: String,
}

impl Cell {
    fn int4(n: i32) -> Self {
        Self {
            binary: Bytes::copy_from_slice(&n.to_be_bytes()),
            text: n.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    None,
    Empty,
    Fail { code: &'static str, message: String },
    Notify { channel: String, payload: String },
    Notice(String),
    Disconnect,
    Garbage,
}

/// What executing one statement produces.
#[derive(Debug, Clone)]
struct Plan {
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Option<Cell>>>,
    tag: String,
    delay: Option<Duration>,
    action: Action,
}

impl Plan {
    fn command(tag: &str) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            tag: tag.to_string(),
            delay: None,
            action: Action::None,
        }
    }

    fn with_action(action: Action) -> Self {
        Self {
            action,
            ..Self::command("")
        }
    }

    fn rows(column: &str, oid: Oid, rows: Vec<Option<Cell>>) -> Self {
        Self {
            columns: vec![(column.to_string(), oid)],
            tag: format!("SELECT {}", rows.len()),
            rows: rows.into_iter().map(|cell| vec![cell]).collect(),
            delay: None,
            action: Action::None,
        }
    }

    fn build(sql: &str, params: &[Option<Bytes>], param_types: &[Oid]) -> Self {
        let sql = sql.trim().trim_end_matches(';').trim();
        let lower = sql.to_ascii_lowercase();

        if lower.is_empty() {
            return Self::with_action(Action::Empty);
        }
        if let Some(args) = call_args(&lower, "select generate_series(") {
            let bounds: Vec<i32> = args
                .split(',')
                .filter_map(|a| a.trim().parse().ok())
                .collect();
            let (start, end) = match bounds.as_slice() {
                [start, end] => (*start, *end),
                _ => (1, 0),
            };
            let cells = (start..=end).map(|n| Some(Cell::int4(n))).collect();
            return Self::rows("generate_series", Oid::INT4, cells);
        }
        if let Some(args) = call_args(&lower, "select pg_sleep(") {
            let secs: f64 = args.trim().parse().unwrap_or(0.0);
            let mut plan = Self::rows(
                "pg_sleep",
                Oid::TEXT,
                vec![Some(Cell {
                    binary: Bytes::new(),
                    text: String::new(),
                })],
            );
            plan.delay = Some(Duration::from_secs_f64(secs));
            return plan;
        }
        if lower.starts_with("select $1") {
            let oid = param_types
                .first()
                .copied()
                .filter(|oid| *oid != Oid::UNSPECIFIED)
                .unwrap_or(Oid::TEXT);
            let cell = params.first().cloned().flatten().map(|raw| Cell {
                text: String::from_utf8_lossy(&raw).into_owned(),
                binary: raw,
            });
            return Self::rows("?column?", oid, vec![cell]);
        }
        if lower.starts_with("select * from missing") {
            return Self::with_action(Action::Fail {
                code: "42P01",
                message: "relation \"missing\" does not exist".to_string(),
            });
        }
        if let Some(n) = lower
            .strip_prefix("select ")
            .and_then(|rest| rest.trim().parse::<i32>().ok())
        {
            return Self::rows("?column?", Oid::INT4, vec![Some(Cell::int4(n))]);
        }
        if let Some(rest) = sql.get("notify ".len()..).filter(|_| lower.starts_with("notify ")) {
            let (channel, payload) = match rest.split_once(',') {
                Some((channel, payload)) => (
                    channel.trim(),
                    payload.trim().trim_matches('\'').to_string(),
                ),
                None => (rest.trim(), String::new()),
            };
            let mut plan = Self::with_action(Action::Notify {
                channel: channel.to_string(),
                payload,
            });
            plan.tag = "NOTIFY".to_string();
            return plan;
        }
        if let Some(rest) = sql.get("notice ".len()..).filter(|_| lower.starts_with("notice ")) {
            let mut plan = Self::with_action(Action::Notice(rest.trim().to_string()));
            plan.tag = "DO".to_string();
            return plan;
        }

        match lower.as_str() {
            "disconnect" => return Self::with_action(Action::Disconnect),
            "garbage" => return Self::with_action(Action::Garbage),
            _ => {}
        }

        let verb = lower.split_whitespace().next().unwrap_or_default();
        match verb {
            "insert" => Self::command("INSERT 0 1"),
            "update" => Self::command("UPDATE 3"),
            "delete" => Self::command("DELETE 2"),
            "create" => Self::command("CREATE TABLE"),
            "rollback" | "abort" => Self::command("ROLLBACK"),
            other => Self::command(&other.to_ascii_uppercase()),
        }
    }
}

fn call_args<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    sql.strip_prefix(prefix)?.split(')').next()
}

fn error(severity: &str, code: &str, message: &str) -> BackendMessage {
    let mut fields = HashMap::new();
    fields.insert(b'S', severity.to_string());
    fields.insert(b'V', severity.to_string());
    fields.insert(b'C', code.to_string());
    fields.insert(b'M', message.to_string());
    BackendMessage::ErrorResponse { fields }
}

// ============================================================================
// Session
// ============================================================================

struct Statement {
    query: String,
    param_types: Vec<Oid>,
}

struct Portal {
    sql: String,
    plan: Plan,
    formats: Vec<Format>,
    sent: usize,
    started: bool,
}

/// Whether the session keeps running after a message.
enum Flow {
    Continue,
    Close,
}

struct Session {
    stream: DuplexStream,
    input: BytesMut,
    output: BytesMut,
    state: Arc<MockState>,
    pid: i32,
    statements: HashMap<String, Statement>,
    portals: HashMap<String, Portal>,
    status: TransactionStatus,
    /// After an extended-protocol error, discard until Sync
    skipping: bool,
}

impl Session {
    async fn run(mut self, mut pushes: broadcast::Receiver<Push>) {
        if self.startup().await.is_ok() {
            self.serve(&mut pushes).await;
        }
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn serve(&mut self, pushes: &mut broadcast::Receiver<Push>) {
        loop {
            loop {
                match FrontendMessage::decode(&mut self.input) {
                    Ok(Some(msg)) => {
                        if let Flow::Close = self.handle(msg).await {
                            let _ = self.flush().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            if self.flush().await.is_err() {
                return;
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.input) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
                push = pushes.recv() => match push {
                    Ok(Push::Notify { channel, payload }) => {
                        self.send(BackendMessage::NotificationResponse {
                            process_id: self.pid,
                            channel,
                            payload,
                        });
                    }
                    Ok(Push::Drop) => return,
                    Err(_) => {}
                },
            }
        }
    }

    async fn startup(&mut self) -> io::Result<()> {
        let user = match self.next(true).await? {
            FrontendMessage::Startup(startup) => startup.user,
            _ => return Err(io::ErrorKind::InvalidData.into()),
        };

        let authenticated = match self.state.auth {
            AuthMethod::Trust => true,
            AuthMethod::Cleartext => {
                self.send(BackendMessage::AuthenticationCleartextPassword);
                let data = self.password_data().await?;
                data.strip_suffix(b"\0") == Some(self.state.password.as_bytes())
            }
            AuthMethod::Md5 => {
                self.send(BackendMessage::AuthenticationMD5Password { salt: SALT });
                let data = self.password_data().await?;
                let expected = md5_password(&user, &self.state.password, &SALT);
                data.strip_suffix(b"\0") == Some(expected.as_bytes())
            }
            AuthMethod::Scram => self.scram_exchange().await?,
        };

        if !authenticated {
            self.send(error(
                "FATAL",
                "28P01",
                &format!("password authentication failed for user \"{}\"", user),
            ));
            self.flush().await?;
            return Err(io::ErrorKind::PermissionDenied.into());
        }

        self.send(BackendMessage::AuthenticationOk);
        self.send(BackendMessage::ParameterStatus {
            name: "server_version".to_string(),
            value: "16.0 (mock)".to_string(),
        });
        self.send(BackendMessage::ParameterStatus {
            name: "client_encoding".to_string(),
            value: "UTF8".to_string(),
        });
        self.send(BackendMessage::BackendKeyData {
            process_id: self.pid,
            secret_key: 42,
        });
        self.send(BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        self.flush().await
    }

    /// Returns whether the client proved knowledge of the password.
    async fn scram_exchange(&mut self) -> io::Result<bool> {
        self.send(BackendMessage::AuthenticationSASL {
            mechanisms: vec![scram::MECHANISM.to_string()],
        });
        let mut initial = self.password_data().await?;

        let mechanism = read_cstr(&mut initial);
        if mechanism != scram::MECHANISM || initial.remaining() < 4 {
            return Ok(false);
        }
        let len = initial.get_i32() as usize;
        let client_first = String::from_utf8_lossy(&initial[..len.min(initial.len())]).into_owned();
        let client_first_bare = client_first.trim_start_matches("n,,").to_string();
        let client_nonce = client_first_bare
            .split(',')
            .find_map(|part| part.strip_prefix("r="))
            .unwrap_or_default()
            .to_string();

        let server_first = format!(
            "r={}mock,s={},i={}",
            client_nonce,
            BASE64.encode(SCRAM_SALT),
            SCRAM_ITERATIONS
        );
        self.send(BackendMessage::AuthenticationSASLContinue {
            data: Bytes::from(server_first.clone()),
        });

        let client_final = String::from_utf8_lossy(&self.password_data().await?).into_owned();
        let Some((without_proof, _proof)) = client_final.split_once(",p=") else {
            return Ok(false);
        };

        // The client verifies this signature; a client using the wrong
        // password rejects it.
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let server_final = scram::server_final_for(
            &self.state.password,
            SCRAM_SALT,
            SCRAM_ITERATIONS,
            &auth_message,
        );
        self.send(BackendMessage::AuthenticationSASLFinal {
            data: Bytes::from(server_final),
        });
        Ok(true)
    }

    async fn password_data(&mut self) -> io::Result<Bytes> {
        self.flush().await?;
        match self.next(false).await? {
            FrontendMessage::Password(msg) => Ok(msg.data),
            _ => Err(io::ErrorKind::InvalidData.into()),
        }
    }

    async fn next(&mut self, startup: bool) -> io::Result<FrontendMessage> {
        loop {
            let decoded = if startup {
                FrontendMessage::decode_startup(&mut self.input)
            } else {
                FrontendMessage::decode(&mut self.input)
            };
            match decoded {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(_) => return Err(io::ErrorKind::InvalidData.into()),
            }
            if self.stream.read_buf(&mut self.input).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    async fn handle(&mut self, msg: FrontendMessage) -> Flow {
        if self.skipping && msg != FrontendMessage::Sync {
            return Flow::Continue;
        }

        match msg {
            FrontendMessage::Query(query) => return self.simple_query(&query.query).await,
            FrontendMessage::Parse(parse) => {
                self.statements.insert(
                    parse.name,
                    Statement {
                        query: parse.query,
                        param_types: parse.param_types,
                    },
                );
                self.send(BackendMessage::ParseComplete);
            }
            FrontendMessage::Bind(bind) => {
                let Some(statement) = self.statements.get(&bind.statement) else {
                    let message = format!("prepared statement \"{}\" does not exist", bind.statement);
                    self.fail("26000", &message);
                    return Flow::Continue;
                };
                let plan = Plan::build(&statement.query, &bind.params, &statement.param_types);
                let formats = column_formats(&bind.result_formats, plan.columns.len());
                self.portals.insert(
                    bind.portal,
                    Portal {
                        sql: statement.query.clone(),
                        plan,
                        formats,
                        sent: 0,
                        started: false,
                    },
                );
                self.send(BackendMessage::BindComplete);
            }
            FrontendMessage::Describe(describe) => match describe.target {
                Target::Statement => {
                    let Some(statement) = self.statements.get(&describe.name) else {
                        self.fail("26000", "prepared statement does not exist");
                        return Flow::Continue;
                    };
                    let param_types = statement.param_types.clone();
                    let plan = Plan::build(&statement.query, &[], &param_types);
                    let formats = vec![Format::Text; plan.columns.len()];
                    self.send(BackendMessage::ParameterDescription {
                        type_oids: param_types,
                    });
                    self.describe_rows(&plan.columns, &formats);
                }
                Target::Portal => {
                    let Some(portal) = self.portals.get(&describe.name) else {
                        self.fail("34000", "portal does not exist");
                        return Flow::Continue;
                    };
                    let (columns, formats) = (portal.plan.columns.clone(), portal.formats.clone());
                    self.describe_rows(&columns, &formats);
                }
            },
            FrontendMessage::Execute(execute) => {
                return self.execute(&execute.portal, execute.max_rows).await;
            }
            FrontendMessage::Close(close) => {
                match close.target {
                    Target::Statement => {
                        self.statements.remove(&close.name);
                        self.state.closed_statements.lock().push(close.name);
                    }
                    Target::Portal => {
                        self.portals.remove(&close.name);
                    }
                }
                self.send(BackendMessage::CloseComplete);
            }
            FrontendMessage::Sync => {
                self.skipping = false;
                if self.status == TransactionStatus::Idle {
                    self.portals.clear();
                }
                self.ready();
            }
            FrontendMessage::Flush => {}
            FrontendMessage::Terminate => return Flow::Close,
            FrontendMessage::Startup(_) | FrontendMessage::Password(_) => {
                self.send(error("FATAL", "08P01", "unexpected message"));
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    async fn simple_query(&mut self, sql: &str) -> Flow {
        let statements: Vec<&str> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if statements.is_empty() {
            self.send(BackendMessage::EmptyQueryResponse);
        }

        for statement in statements {
            let plan = Plan::build(statement, &[], &[]);
            match self.run_plan(statement, &plan).await {
                Some(Flow::Close) => return Flow::Close,
                Some(Flow::Continue) => {}
                // An error ends the batch
                None => break,
            }
            let formats = vec![Format::Text; plan.columns.len()];
            if !plan.columns.is_empty() {
                self.describe_rows(&plan.columns, &formats);
            }
            for row in &plan.rows {
                self.send_row(row, &formats);
            }
            if !matches!(plan.action, Action::Empty) {
                self.send(BackendMessage::CommandComplete {
                    tag: plan.tag.clone(),
                });
            }
        }

        self.skipping = false;
        self.ready();
        Flow::Continue
    }

    async fn execute(&mut self, name: &str, max_rows: i32) -> Flow {
        let Some(portal) = self.portals.get(name) else {
            self.fail("34000", &format!("portal \"{}\" does not exist", name));
            return Flow::Continue;
        };

        if !portal.started {
            let (sql, plan) = (portal.sql.clone(), portal.plan.clone());
            match self.run_plan(&sql, &plan).await {
                Some(Flow::Close) => return Flow::Close,
                Some(Flow::Continue) => {}
                None => return Flow::Continue,
            }
            if let Some(portal) = self.portals.get_mut(name) {
                portal.started = true;
            }
        }

        let Some(portal) = self.portals.get_mut(name) else {
            return Flow::Continue;
        };
        if matches!(portal.plan.action, Action::Empty) {
            self.send(BackendMessage::EmptyQueryResponse);
            return Flow::Continue;
        }

        let remaining = portal.plan.rows.len() - portal.sent;
        let count = if max_rows <= 0 {
            remaining
        } else {
            remaining.min(max_rows as usize)
        };
        let rows: Vec<Vec<Option<Cell>>> =
            portal.plan.rows[portal.sent..portal.sent + count].to_vec();
        portal.sent += count;
        let suspended = portal.sent < portal.plan.rows.len();
        let formats = portal.formats.clone();
        let tag = portal.plan.tag.clone();

        for row in &rows {
            self.send_row(row, &formats);
        }
        if suspended {
            self.send(BackendMessage::PortalSuspended);
        } else {
            self.send(BackendMessage::CommandComplete { tag });
        }
        Flow::Continue
    }

    /// Apply a statement's side effects. `None` means it failed.
    async fn run_plan(&mut self, sql: &str, plan: &Plan) -> Option<Flow> {
        let verb = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if self.status == TransactionStatus::Failed && !matches!(verb.as_str(), "rollback" | "commit" | "abort") {
            self.fail(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
            return None;
        }

        self.state.executed.lock().push(sql.to_string());

        if let Some(delay) = plan.delay {
            let _ = self.flush().await;
            tokio::time::sleep(delay).await;
        }

        match &plan.action {
            Action::None | Action::Empty => {}
            Action::Fail { code, message } => {
                self.fail(code, message);
                return None;
            }
            Action::Notify { channel, payload } => {
                self.send(BackendMessage::NotificationResponse {
                    process_id: self.pid,
                    channel: channel.clone(),
                    payload: payload.clone(),
                });
            }
            Action::Notice(message) => {
                let mut fields = HashMap::new();
                fields.insert(b'S', "NOTICE".to_string());
                fields.insert(b'C', "00000".to_string());
                fields.insert(b'M', message.clone());
                self.send(BackendMessage::NoticeResponse { fields });
            }
            Action::Disconnect => return Some(Flow::Close),
            Action::Garbage => {
                self.output.put_slice(&[b'Z', 0, 0, 0, 2]);
                return Some(Flow::Continue);
            }
        }

        match verb.as_str() {
            "begin" => self.status = TransactionStatus::InTransaction,
            "commit" | "rollback" | "abort" => self.status = TransactionStatus::Idle,
            _ => {}
        }
        Some(Flow::Continue)
    }

    fn fail(&mut self, code: &str, message: &str) {
        self.send(error("ERROR", code, message));
        self.skipping = true;
        if self.status == TransactionStatus::InTransaction {
            self.status = TransactionStatus::Failed;
        }
    }

    fn describe_rows(&mut self, columns: &[(String, Oid)], formats: &[Format]) {
        if columns.is_empty() {
            self.send(BackendMessage::NoData);
            return;
        }
        let fields = columns
            .iter()
            .zip(formats)
            .map(|((name, oid), format)| FieldDescription::new(name, *oid, *format))
            .collect();
        self.send(BackendMessage::RowDescription { fields });
    }

    fn send_row(&mut self, row: &[Option<Cell>], formats: &[Format]) {
        let values = row
            .iter()
            .zip(formats)
            .map(|(cell, format)| {
                cell.as_ref().map(|cell| match format {
                    Format::Binary => cell.binary.clone(),
                    Format::Text => Bytes::from(cell.text.clone()),
                })
            })
            .collect();
        self.send(BackendMessage::DataRow { values });
    }

    fn ready(&mut self) {
        self.send(BackendMessage::ReadyForQuery {
            status: self.status,
        });
    }

    fn send(&mut self, msg: BackendMessage) {
        msg.encode(&mut self.output);
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        let out = self.output.split();
        self.stream.write_all(&out).await?;
        self.stream.flush().await
    }
}

fn column_formats(requested: &[Format], columns: usize) -> Vec<Format> {
    match requested {
        [] => vec![Format::Text; columns],
        [single] => vec![*single; columns],
        many => many.iter().copied().take(columns).collect(),
    }
}

fn read_cstr(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    s
}
