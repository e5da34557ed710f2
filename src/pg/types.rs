//! PostgreSQL type encoding and decoding.
//!
//! This module provides binary and text format encoding/decoding for
//! PostgreSQL types. It sits outside the framing layer: the codec hands raw
//! column bytes over, and a failure here is scoped to a single field.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use smallvec::SmallVec;
use thiserror::Error;

use super::error::{PgError, PgResult};
use super::protocol::Format;
use super::statement::SharedColumns;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the parameter type
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A column value that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValueDecodeError(pub String);

type DecodeResult<T> = Result<T, ValueDecodeError>;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Days between 1970-01-01 and 2000-01-01.
const PG_EPOCH_OFFSET_DAYS: i32 = 10_957;

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    // Days since 2000-01-01
    Date(i32),
    Time(i64),
    Json(String),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // JSONB binary format carries a version byte prefix
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Encode as a Bind parameter; `None` is SQL NULL.
    pub fn to_param(&self) -> Option<Bytes> {
        if self.is_null() {
            None
        } else {
            Some(Bytes::from(self.encode_binary()))
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value in the given wire format.
    pub fn decode(oid: Oid, format: Format, data: &[u8]) -> DecodeResult<Self> {
        match format {
            Format::Binary => Self::decode_binary(oid, data),
            Format::Text => Self::decode_text(oid, data),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> DecodeResult<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(PgValue::Bool(*b != 0)),
                _ => Err(bad_length("BOOL", data)),
            },
            Oid::INT2 => fixed::<2>("INT2", data).map(|b| PgValue::Int2(i16::from_be_bytes(b))),
            Oid::INT4 => fixed::<4>("INT4", data).map(|b| PgValue::Int4(i32::from_be_bytes(b))),
            Oid::INT8 => fixed::<8>("INT8", data).map(|b| PgValue::Int8(i64::from_be_bytes(b))),
            Oid::FLOAT4 => {
                fixed::<4>("FLOAT4", data).map(|b| PgValue::Float4(f32::from_be_bytes(b)))
            }
            Oid::FLOAT8 => {
                fixed::<8>("FLOAT8", data).map(|b| PgValue::Float8(f64::from_be_bytes(b)))
            }

            _ if oid.is_text_like() => String::from_utf8(data.to_vec())
                .map(PgValue::Text)
                .map_err(|e| ValueDecodeError(format!("Invalid UTF-8 in TEXT: {}", e))),

            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => fixed::<16>("UUID", data).map(PgValue::Uuid),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                fixed::<8>("TIMESTAMP", data).map(|b| PgValue::Timestamp(i64::from_be_bytes(b)))
            }
            Oid::DATE => fixed::<4>("DATE", data).map(|b| PgValue::Date(i32::from_be_bytes(b))),
            Oid::TIME | Oid::TIMETZ => {
                if data.len() < 8 {
                    return Err(bad_length("TIME", data));
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&data[..8]);
                Ok(PgValue::Time(i64::from_be_bytes(b)))
            }

            Oid::JSON | Oid::JSONB => {
                let json_data = match (oid, data) {
                    (Oid::JSONB, [1, rest @ ..]) => rest,
                    (Oid::JSONB, [version, ..]) => {
                        return Err(ValueDecodeError(format!(
                            "Unsupported JSONB version: {}",
                            version
                        )))
                    }
                    _ => data,
                };
                String::from_utf8(json_data.to_vec())
                    .map(PgValue::Json)
                    .map_err(|e| ValueDecodeError(format!("Invalid UTF-8 in JSON: {}", e)))
            }

            // For unknown types, store raw bytes
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol)
    pub fn decode_text(oid: Oid, data: &[u8]) -> DecodeResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ValueDecodeError(format!("Invalid UTF-8: {}", e)))?;

        match oid {
            Oid::BOOL => match text {
                "t" | "true" | "1" => Ok(PgValue::Bool(true)),
                "f" | "false" | "0" => Ok(PgValue::Bool(false)),
                other => Err(ValueDecodeError(format!("Invalid BOOL: {}", other))),
            },
            Oid::INT2 => parse_text(text, "INT2").map(PgValue::Int2),
            Oid::INT4 => parse_text(text, "INT4").map(PgValue::Int4),
            Oid::INT8 => parse_text(text, "INT8").map(PgValue::Int8),
            Oid::FLOAT4 => parse_text(text, "FLOAT4").map(PgValue::Float4),
            Oid::FLOAT8 => parse_text(text, "FLOAT8").map(PgValue::Float8),
            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text.to_string())),
            Oid::UUID => uuid::Uuid::parse_str(text)
                .map(|u| PgValue::Uuid(*u.as_bytes()))
                .map_err(|e| ValueDecodeError(format!("Invalid UUID: {}", e))),

            // Default: treat as text
            _ => Ok(PgValue::Text(text.to_string())),
        }
    }

    /// Interpret a TIMESTAMP value.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            PgValue::Timestamp(micros) => {
                DateTime::<Utc>::from_timestamp_micros(micros.checked_add(PG_EPOCH_OFFSET_MICROS)?)
                    .map(|dt| dt.naive_utc())
            }
            _ => None,
        }
    }

    /// Interpret a DATE value.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            PgValue::Date(days) => {
                let unix_days = days.checked_add(PG_EPOCH_OFFSET_DAYS)?;
                DateTime::<Utc>::from_timestamp(i64::from(unix_days) * 86_400, 0)
                    .map(|dt| dt.date_naive())
            }
            _ => None,
        }
    }

    /// Interpret a UUID value.
    pub fn as_uuid(&self) -> Option<uuid::Uuid> {
        match self {
            PgValue::Uuid(bytes) => Some(uuid::Uuid::from_bytes(*bytes)),
            _ => None,
        }
    }

    /// Parse a JSON/JSONB value.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        match self {
            PgValue::Json(s) => serde_json::from_str(s).ok(),
            _ => None,
        }
    }

    /// Borrow a TEXT value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }
}

fn bad_length(ty: &str, data: &[u8]) -> ValueDecodeError {
    ValueDecodeError(format!("Invalid {} length: {}", ty, data.len()))
}

fn fixed<const N: usize>(ty: &str, data: &[u8]) -> DecodeResult<[u8; N]> {
    data.try_into().map_err(|_| bad_length(ty, data))
}

fn parse_text<T: std::str::FromStr>(text: &str, ty: &str) -> DecodeResult<T>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| ValueDecodeError(format!("Invalid {}: {}", ty, e)))
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<uuid::Uuid> for PgValue {
    fn from(v: uuid::Uuid) -> Self {
        PgValue::Uuid(*v.as_bytes())
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        PgValue::Timestamp(v.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v.to_string())
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PgValue::Null)
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One result row, decoded lazily per column.
///
/// Raw payloads are kept as received; a decode failure is reported for the
/// requested column only and never affects the connection.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    // Inline storage avoids a heap allocation for rows of up to 16 columns
    values: SmallVec<[Option<Bytes>; 16]>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: Vec<Option<Bytes>>) -> Self {
        Self {
            columns,
            values: SmallVec::from_vec(values),
        }
    }

    /// Number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptions shared with the producing statement.
    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Raw payload of a column; `Some(None)` is SQL NULL.
    pub fn raw(&self, idx: usize) -> Option<Option<&[u8]>> {
        self.values.get(idx).map(|v| v.as_deref())
    }

    /// Decode one column.
    pub fn try_get(&self, idx: usize) -> PgResult<PgValue> {
        let value = self.values.get(idx).ok_or_else(|| PgError::Decode {
            column: idx,
            message: format!("Column index out of range (row has {})", self.values.len()),
        })?;

        let Some(data) = value else {
            return Ok(PgValue::Null);
        };

        let (oid, format) = self
            .columns
            .get(idx)
            .map(|c| (c.type_oid, c.format))
            .unwrap_or((Oid::TEXT, Format::Text));

        PgValue::decode(oid, format, data).map_err(|e| PgError::Decode {
            column: idx,
            message: e.0,
        })
    }

    /// Decode a column by name.
    pub fn try_get_by_name(&self, name: &str) -> PgResult<PgValue> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PgError::Decode {
                column: self.values.len(),
                message: format!("No column named {}", name),
            })?;
        self.try_get(idx)
    }

    /// Decode every column.
    pub fn values(&self) -> PgResult<Vec<PgValue>> {
        (0..self.values.len()).map(|i| self.try_get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::FieldDescription;
    use std::sync::Arc;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(Oid::FLOAT8.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_int4_roundtrip() {
        let original = PgValue::Int4(12345);
        let encoded = original.encode_binary();
        let decoded = PgValue::decode_binary(Oid::INT4, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_jsonb_roundtrip() {
        let original = PgValue::from(serde_json::json!({"a": 1}));
        let decoded = PgValue::decode_binary(Oid::JSONB, &original.encode_binary()).unwrap();
        assert_eq!(decoded.as_json(), Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_timestamp_conversion() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let value = PgValue::from(dt);
        assert_eq!(value.as_datetime(), Some(dt));
        assert_eq!(
            PgValue::Date(0).as_date(),
            NaiveDate::from_ymd_opt(2000, 1, 1)
        );
    }

    #[test]
    fn test_decode_error_is_scoped_to_column() {
        let columns = Arc::new(vec![
            FieldDescription::new("id", Oid::INT4, Format::Binary),
            FieldDescription::new("name", Oid::TEXT, Format::Binary),
        ]);
        let row = Row::new(
            columns,
            vec![
                Some(Bytes::from_static(&[0, 1])), // wrong width for INT4
                Some(Bytes::from_static(b"alice")),
            ],
        );

        match row.try_get(0) {
            Err(PgError::Decode { column, .. }) => assert_eq!(column, 0),
            other => panic!("expected decode error, got {:?}", other),
        }
        assert_eq!(
            row.try_get_by_name("name").unwrap(),
            PgValue::Text("alice".to_string())
        );
    }

    #[test]
    fn test_text_format_decoding() {
        assert_eq!(
            PgValue::decode(Oid::INT8, Format::Text, b"42").unwrap(),
            PgValue::Int8(42)
        );
        assert!(PgValue::decode(Oid::BOOL, Format::Text, b"maybe").is_err());
    }
}
