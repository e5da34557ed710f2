//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements framing for the PostgreSQL v3 protocol. Messages
//! are encoded into a `BytesMut` and decoded from a growing read buffer; a
//! buffer holding a partial frame is left untouched until more bytes arrive.
//! Column payloads are carried as raw bytes and handed to [`super::types`].
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Largest frame accepted from the peer (length prefix included).
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Largest element count an Int16 count field can carry.
pub const MAX_FIELD_COUNT: usize = i16::MAX as usize;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_i16(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Protocol(format!("Unknown format code: {}", other))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "Unknown transaction status: {}",
                other as char
            ))),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Object addressed by Describe and Close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(PgError::Protocol(format!(
                "Unknown describe/close target: {}",
                other as char
            ))),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Startup message sent at connection start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

/// Password message ('p').
///
/// Cleartext, MD5 and both SASL responses share this tag; the payload is
/// kept raw and interpreted by whoever knows the authentication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    pub data: Bytes,
}

impl PasswordMessage {
    /// Cleartext or MD5-hashed password (null-terminated).
    pub fn password(password: &str) -> Self {
        let mut data = BytesMut::with_capacity(password.len() + 1);
        put_cstr(&mut data, password);
        Self {
            data: data.freeze(),
        }
    }

    /// SASLInitialResponse: mechanism name followed by the length-prefixed first message.
    pub fn sasl_initial(mechanism: &str, initial: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(mechanism.len() + 5 + initial.len());
        put_cstr(&mut data, mechanism);
        data.put_i32(initial.len() as i32);
        data.put_slice(initial);
        Self {
            data: data.freeze(),
        }
    }

    /// SASLResponse: raw mechanism data.
    pub fn sasl_response(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub query: String,
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// Already-encoded parameter values; `None` is SQL NULL.
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMessage {
    pub portal: String,
    /// Row limit; 0 means no limit
    pub max_rows: i32,
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeMessage {
    pub target: Target,
    pub name: String,
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessage {
    pub target: Target,
    pub name: String,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Startup(StartupMessage),
    Password(PasswordMessage),
    Query(QueryMessage),
    Parse(ParseMessage),
    Bind(BindMessage),
    Execute(ExecuteMessage),
    Describe(DescribeMessage),
    Close(CloseMessage),
    Sync,
    Flush,
    Terminate,
}

macro_rules! frontend_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for FrontendMessage {
                fn from(msg: $ty) -> Self {
                    FrontendMessage::$variant(msg)
                }
            }
        )*
    };
}

frontend_from!(
    Startup(StartupMessage),
    Password(PasswordMessage),
    Query(QueryMessage),
    Parse(ParseMessage),
    Bind(BindMessage),
    Execute(ExecuteMessage),
    Describe(DescribeMessage),
    Close(CloseMessage),
);

impl FrontendMessage {
    /// Check that every count and length fits its wire field.
    ///
    /// `encode` assumes this holds; callers that build messages from user
    /// input run it first.
    pub fn check(&self) -> PgResult<()> {
        match self {
            FrontendMessage::Password(msg) => check_len(msg.data.len()),
            FrontendMessage::Query(msg) => check_len(msg.query.len()),
            FrontendMessage::Parse(msg) => {
                check_len(msg.query.len())?;
                check_count("parameter types", msg.param_types.len())
            }
            FrontendMessage::Bind(msg) => {
                check_count("parameter formats", msg.param_formats.len())?;
                check_count("parameters", msg.params.len())?;
                check_count("result formats", msg.result_formats.len())?;
                let total: usize = msg.params.iter().flatten().map(Bytes::len).sum();
                check_len(total)
            }
            _ => Ok(()),
        }
    }

    /// Append the encoded message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            FrontendMessage::Startup(msg) => {
                let start = buf.len();
                // Length placeholder, patched once the parameters are written
                buf.put_i32(0);
                buf.put_i32(PROTOCOL_VERSION);

                put_cstr(buf, "user");
                put_cstr(buf, &msg.user);
                if let Some(ref db) = msg.database {
                    put_cstr(buf, "database");
                    put_cstr(buf, db);
                }
                for (key, value) in &msg.options {
                    put_cstr(buf, key);
                    put_cstr(buf, value);
                }
                buf.put_u8(0);

                let len = (buf.len() - start) as i32;
                buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
            }
            FrontendMessage::Password(msg) => {
                write_frame(buf, b'p', |body| body.put_slice(&msg.data));
            }
            FrontendMessage::Query(msg) => {
                write_frame(buf, b'Q', |body| put_cstr(body, &msg.query));
            }
            FrontendMessage::Parse(msg) => write_frame(buf, b'P', |body| {
                put_cstr(body, &msg.name);
                put_cstr(body, &msg.query);
                body.put_i16(msg.param_types.len() as i16);
                for oid in &msg.param_types {
                    body.put_i32(oid.as_i32());
                }
            }),
            FrontendMessage::Bind(msg) => write_frame(buf, b'B', |body| {
                put_cstr(body, &msg.portal);
                put_cstr(body, &msg.statement);
                body.put_i16(msg.param_formats.len() as i16);
                for fmt in &msg.param_formats {
                    body.put_i16(*fmt as i16);
                }
                body.put_i16(msg.params.len() as i16);
                for param in &msg.params {
                    match param {
                        Some(value) => {
                            body.put_i32(value.len() as i32);
                            body.put_slice(value);
                        }
                        None => body.put_i32(-1),
                    }
                }
                body.put_i16(msg.result_formats.len() as i16);
                for fmt in &msg.result_formats {
                    body.put_i16(*fmt as i16);
                }
            }),
            FrontendMessage::Execute(msg) => write_frame(buf, b'E', |body| {
                put_cstr(body, &msg.portal);
                body.put_i32(msg.max_rows);
            }),
            FrontendMessage::Describe(msg) => write_frame(buf, b'D', |body| {
                body.put_u8(msg.target.as_byte());
                put_cstr(body, &msg.name);
            }),
            FrontendMessage::Close(msg) => write_frame(buf, b'C', |body| {
                body.put_u8(msg.target.as_byte());
                put_cstr(body, &msg.name);
            }),
            FrontendMessage::Sync => write_frame(buf, b'S', |_| {}),
            FrontendMessage::Flush => write_frame(buf, b'H', |_| {}),
            FrontendMessage::Terminate => write_frame(buf, b'X', |_| {}),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode the untagged startup packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the packet is incomplete.
    pub fn decode_startup(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len < 8 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgError::Protocol(format!(
                "Invalid startup packet length: {}",
                len
            )));
        }
        let len = len as usize;
        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        let mut body = buf.split_to(len).freeze();
        body.advance(4);
        let version = get_i32(&mut body)?;
        if version != PROTOCOL_VERSION {
            return Err(PgError::Protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let mut user = None;
        let mut database = None;
        let mut options = Vec::new();
        loop {
            let key = read_cstring(&mut body)?;
            if key.is_empty() {
                break;
            }
            let value = read_cstring(&mut body)?;
            match key.as_str() {
                "user" => user = Some(value),
                "database" => database = Some(value),
                _ => options.push((key, value)),
            }
        }

        let user =
            user.ok_or_else(|| PgError::Protocol("Startup packet without user".to_string()))?;
        Ok(Some(FrontendMessage::Startup(StartupMessage {
            user,
            database,
            options,
        })))
    }

    /// Decode one tagged frontend message from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete.
    pub fn decode(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        let Some((tag, mut body)) = split_frame(buf)? else {
            return Ok(None);
        };

        let msg = match tag {
            b'p' => FrontendMessage::Password(PasswordMessage { data: body }),
            b'Q' => FrontendMessage::Query(QueryMessage {
                query: read_cstring(&mut body)?,
            }),
            b'P' => {
                let name = read_cstring(&mut body)?;
                let query = read_cstring(&mut body)?;
                let count = get_count(&mut body)?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(Oid::from_i32(get_i32(&mut body)?));
                }
                FrontendMessage::Parse(ParseMessage {
                    name,
                    query,
                    param_types,
                })
            }
            b'B' => {
                let portal = read_cstring(&mut body)?;
                let statement = read_cstring(&mut body)?;
                let param_formats = read_formats(&mut body)?;
                let count = get_count(&mut body)?;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(read_value(&mut body)?);
                }
                let result_formats = read_formats(&mut body)?;
                FrontendMessage::Bind(BindMessage {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                })
            }
            b'E' => FrontendMessage::Execute(ExecuteMessage {
                portal: read_cstring(&mut body)?,
                max_rows: get_i32(&mut body)?,
            }),
            b'D' => FrontendMessage::Describe(DescribeMessage {
                target: Target::from_byte(get_u8(&mut body)?)?,
                name: read_cstring(&mut body)?,
            }),
            b'C' => FrontendMessage::Close(CloseMessage {
                target: Target::from_byte(get_u8(&mut body)?)?,
                name: read_cstring(&mut body)?,
            }),
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'X' => FrontendMessage::Terminate,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown frontend message type: {}",
                    tag as char
                )))
            }
        };
        Ok(Some(msg))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

impl FieldDescription {
    /// A computed column of the given type (no source table).
    pub fn new(name: &str, type_oid: Oid, format: Format) -> Self {
        Self {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format,
        }
    }
}

/// Backend message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode one backend message from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame; the
    /// buffer is left unchanged in that case. A length prefix below 4 or above
    /// [`MAX_MESSAGE_LEN`] is a protocol error.
    pub fn decode(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        let Some((tag, body)) = split_frame(buf)? else {
            return Ok(None);
        };

        let msg = match tag {
            b'R' => Self::decode_auth(body)?,
            b'T' => Self::decode_row_description(body)?,
            b'D' => Self::decode_data_row(body)?,
            b'C' => Self::decode_command_complete(body)?,
            b'Z' => Self::decode_ready_for_query(body)?,
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            },
            b'S' => Self::decode_parameter_status(body)?,
            b'K' => Self::decode_backend_key_data(body)?,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(body)?,
            b'A' => Self::decode_notification_response(body)?,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {}",
                    tag as char
                )))
            }
        };
        Ok(Some(msg))
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        let auth_type = get_i32(&mut body)?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&get_bytes(&mut body, 4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unknown authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        let num_fields = get_count(&mut body)?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: read_cstring(&mut body)?,
                table_oid: get_i32(&mut body)?,
                column_attr: get_i16(&mut body)?,
                type_oid: Oid::from_i32(get_i32(&mut body)?),
                type_size: get_i16(&mut body)?,
                type_modifier: get_i32(&mut body)?,
                format: Format::from_i16(get_i16(&mut body)?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        let num_cols = get_count(&mut body)?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            values.push(read_value(&mut body)?);
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        let status = TransactionStatus::from_byte(get_u8(&mut body)?)?;
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        let process_id = get_i32(&mut body)?;
        let secret_key = get_i32(&mut body)?;
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        let num_params = get_count(&mut body)?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(get_i32(&mut body)?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        let process_id = get_i32(&mut body)?;
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }

    /// Append the encoded message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => write_frame(buf, b'R', |b| b.put_i32(0)),
            BackendMessage::AuthenticationCleartextPassword => {
                write_frame(buf, b'R', |b| b.put_i32(3))
            }
            BackendMessage::AuthenticationMD5Password { salt } => write_frame(buf, b'R', |b| {
                b.put_i32(5);
                b.put_slice(salt);
            }),
            BackendMessage::AuthenticationSASL { mechanisms } => write_frame(buf, b'R', |b| {
                b.put_i32(10);
                for mech in mechanisms {
                    put_cstr(b, mech);
                }
                b.put_u8(0);
            }),
            BackendMessage::AuthenticationSASLContinue { data } => write_frame(buf, b'R', |b| {
                b.put_i32(11);
                b.put_slice(data);
            }),
            BackendMessage::AuthenticationSASLFinal { data } => write_frame(buf, b'R', |b| {
                b.put_i32(12);
                b.put_slice(data);
            }),
            BackendMessage::RowDescription { fields } => write_frame(buf, b'T', |b| {
                b.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstr(b, &field.name);
                    b.put_i32(field.table_oid);
                    b.put_i16(field.column_attr);
                    b.put_i32(field.type_oid.as_i32());
                    b.put_i16(field.type_size);
                    b.put_i32(field.type_modifier);
                    b.put_i16(field.format as i16);
                }
            }),
            BackendMessage::DataRow { values } => write_frame(buf, b'D', |b| {
                b.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        Some(data) => {
                            b.put_i32(data.len() as i32);
                            b.put_slice(data);
                        }
                        None => b.put_i32(-1),
                    }
                }
            }),
            BackendMessage::CommandComplete { tag } => write_frame(buf, b'C', |b| put_cstr(b, tag)),
            BackendMessage::EmptyQueryResponse => write_frame(buf, b'I', |_| {}),
            BackendMessage::ParseComplete => write_frame(buf, b'1', |_| {}),
            BackendMessage::BindComplete => write_frame(buf, b'2', |_| {}),
            BackendMessage::CloseComplete => write_frame(buf, b'3', |_| {}),
            BackendMessage::NoData => write_frame(buf, b'n', |_| {}),
            BackendMessage::PortalSuspended => write_frame(buf, b's', |_| {}),
            BackendMessage::ReadyForQuery { status } => {
                write_frame(buf, b'Z', |b| b.put_u8(status.as_byte()))
            }
            BackendMessage::ParameterStatus { name, value } => write_frame(buf, b'S', |b| {
                put_cstr(b, name);
                put_cstr(b, value);
            }),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => write_frame(buf, b'K', |b| {
                b.put_i32(*process_id);
                b.put_i32(*secret_key);
            }),
            BackendMessage::ErrorResponse { fields } => {
                write_frame(buf, b'E', |b| write_error_fields(b, fields))
            }
            BackendMessage::NoticeResponse { fields } => {
                write_frame(buf, b'N', |b| write_error_fields(b, fields))
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => write_frame(buf, b'A', |b| {
                b.put_i32(*process_id);
                put_cstr(b, channel);
                put_cstr(b, payload);
            }),
            BackendMessage::ParameterDescription { type_oids } => write_frame(buf, b't', |b| {
                b.put_i16(type_oids.len() as i16);
                for oid in type_oids {
                    b.put_i32(oid.as_i32());
                }
            }),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

/// Drain every complete backend frame from `buf`.
///
/// Whatever remains in `buf` afterwards is the leftover partial frame, to be
/// completed by the next read.
pub fn decode_frames(buf: &mut BytesMut) -> PgResult<Vec<BackendMessage>> {
    let mut messages = Vec::new();
    while let Some(msg) = BackendMessage::decode(buf)? {
        messages.push(msg);
    }
    Ok(messages)
}

/// Build a server error from ErrorResponse fields.
pub fn error_from_fields(fields: &HashMap<u8, String>) -> PgError {
    PgError::Server {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
        position: fields.get(&b'P').cloned(),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Split a complete tagged frame off `buf`, returning its tag and body.
fn split_frame(buf: &mut BytesMut) -> PgResult<Option<(u8, Bytes)>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(PgError::Protocol(format!(
            "Invalid message length {} for type {}",
            len, buf[0] as char
        )));
    }

    // type byte + length field value (includes length field itself)
    let total_len = 1 + len as usize;
    if buf.len() < total_len {
        buf.reserve(total_len - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(total_len).freeze();
    let tag = frame.get_u8();
    frame.advance(4);
    Ok(Some((tag, frame)))
}

/// Write `tag`, a length placeholder, the body, then patch the length.
fn write_frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Reject `count` elements if they overflow an Int16 count field.
pub(crate) fn check_count(what: &str, count: usize) -> PgResult<()> {
    if count > MAX_FIELD_COUNT {
        return Err(PgError::Encode(format!(
            "{count} {what} exceed the limit of {MAX_FIELD_COUNT}"
        )));
    }
    Ok(())
}

fn check_len(len: usize) -> PgResult<()> {
    if len > MAX_MESSAGE_LEN {
        return Err(PgError::Encode(format!(
            "{len} bytes exceed the message limit of {MAX_MESSAGE_LEN}"
        )));
    }
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn truncated() -> PgError {
    PgError::Protocol("Message body truncated".to_string())
}

fn get_u8(buf: &mut Bytes) -> PgResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn get_count(buf: &mut Bytes) -> PgResult<usize> {
    let n = get_i16(buf)?;
    if n < 0 {
        return Err(PgError::Protocol(format!("Negative element count: {}", n)));
    }
    Ok(n as usize)
}

fn get_bytes(buf: &mut Bytes, len: usize) -> PgResult<Bytes> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

/// Read a length-prefixed value; -1 is NULL.
fn read_value(buf: &mut Bytes) -> PgResult<Option<Bytes>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    get_bytes(buf, len as usize).map(Some)
}

fn read_formats(buf: &mut Bytes) -> PgResult<Vec<Format>> {
    let count = get_count(buf)?;
    let mut formats = Vec::with_capacity(count);
    for _ in 0..count {
        formats.push(Format::from_i16(get_i16(buf)?)?);
    }
    Ok(formats)
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

fn write_error_fields(buf: &mut BytesMut, fields: &HashMap<u8, String>) {
    for (code, value) in fields {
        buf.put_u8(*code);
        put_cstr(buf, value);
    }
    buf.put_u8(0);
}
