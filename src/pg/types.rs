//! PostgreSQL values and their wire representations.
//!
//! Parameters always travel in text format. Result cells arrive in text or
//! binary format as announced by the column description, and are decoded
//! according to the column's type OID.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use uuid::Uuid;

use super::transport::Format;
use crate::error::{DriverError, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

/// Days from 0001-01-01 (day 1) to 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

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
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
///
/// This is the closed set of values accepted as parameters and produced by
/// row decoding.
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
    Uuid(Uuid),
    /// Microseconds since 2000-01-01 00:00:00
    Timestamp(i64),
    /// Days since 2000-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    Json(serde_json::Value),
    /// Types without a dedicated variant keep their raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(f64::from(*v)),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The externally visible text representation, as PostgreSQL's text
    /// input functions accept it. `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => v.to_string(),
            PgValue::Float8(v) => v.to_string(),
            PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut hex = String::with_capacity(2 + v.len() * 2);
                hex.push_str("\\x");
                for byte in v {
                    hex.push_str(&format!("{:02x}", byte));
                }
                hex
            }
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Timestamp(micros) => match timestamp_from_micros(*micros) {
                Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                None => micros.to_string(),
            },
            PgValue::Date(days) => match date_from_days(*days) {
                Some(date) => date.format("%Y-%m-%d").to_string(),
                None => days.to_string(),
            },
            PgValue::Time(micros) => match time_from_micros(*micros) {
                Some(time) => time.format("%H:%M:%S%.f").to_string(),
                None => micros.to_string(),
            },
            PgValue::Json(v) => v.to_string(),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        };
        Some(text)
    }

    /// Decode a cell according to its column's type and format.
    pub fn decode(oid: Oid, format: Format, data: &[u8]) -> Result<Self> {
        match format {
            Format::Text => Self::decode_text(oid, data),
            Format::Binary => Self::decode_binary(oid, data),
        }
    }

    /// Decode from text format.
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| DriverError::TypeError(format!("Invalid UTF-8 in text value: {}", e)))?;

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(matches!(text, "t" | "true" | "1"))),

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| DriverError::TypeError(format!("Invalid INT2: {}", e))),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| DriverError::TypeError(format!("Invalid INT4: {}", e))),

            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| DriverError::TypeError(format!("Invalid INT8: {}", e))),

            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| DriverError::TypeError(format!("Invalid FLOAT4: {}", e))),

            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| DriverError::TypeError(format!("Invalid FLOAT8: {}", e))),

            Oid::BYTEA => match text.strip_prefix("\\x") {
                Some(hex) => decode_hex(hex).map(PgValue::Bytea),
                None => Ok(PgValue::Bytea(data.to_vec())),
            },

            Oid::UUID => Uuid::parse_str(text)
                .map(PgValue::Uuid)
                .map_err(|e| DriverError::TypeError(format!("Invalid UUID: {}", e))),

            Oid::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ts| PgValue::Timestamp(ts.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS))
                .map_err(|e| DriverError::TypeError(format!("Invalid TIMESTAMP: {}", e))),

            Oid::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|ts| PgValue::Timestamp(ts.timestamp_micros() - PG_EPOCH_UNIX_MICROS))
                .map_err(|e| DriverError::TypeError(format!("Invalid TIMESTAMPTZ: {}", e))),

            Oid::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|date| PgValue::Date(date.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE))
                .map_err(|e| DriverError::TypeError(format!("Invalid DATE: {}", e))),

            Oid::TIME => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map(|time| {
                    PgValue::Time(
                        i64::from(time.num_seconds_from_midnight()) * 1_000_000
                            + i64::from(time.nanosecond() / 1_000),
                    )
                })
                .map_err(|e| DriverError::TypeError(format!("Invalid TIME: {}", e))),

            Oid::JSON | Oid::JSONB => serde_json::from_str(text)
                .map(PgValue::Json)
                .map_err(|e| DriverError::TypeError(format!("Invalid JSON: {}", e))),

            // Text types and anything unknown stay text
            _ => Ok(PgValue::Text(text.to_string())),
        }
    }

    /// Decode from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match oid {
            Oid::BOOL => data
                .first()
                .map(|b| PgValue::Bool(*b != 0))
                .ok_or_else(|| DriverError::TypeError("Empty data for BOOL".to_string())),
            Oid::INT2 => fixed::<2>(data, "INT2").map(|b| PgValue::Int2(i16::from_be_bytes(b))),
            Oid::INT4 => fixed::<4>(data, "INT4").map(|b| PgValue::Int4(i32::from_be_bytes(b))),
            Oid::INT8 => fixed::<8>(data, "INT8").map(|b| PgValue::Int8(i64::from_be_bytes(b))),
            Oid::FLOAT4 => {
                fixed::<4>(data, "FLOAT4").map(|b| PgValue::Float4(f32::from_be_bytes(b)))
            }
            Oid::FLOAT8 => {
                fixed::<8>(data, "FLOAT8").map(|b| PgValue::Float8(f64::from_be_bytes(b)))
            }
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => fixed::<16>(data, "UUID").map(|b| PgValue::Uuid(Uuid::from_bytes(b))),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                fixed::<8>(data, "TIMESTAMP").map(|b| PgValue::Timestamp(i64::from_be_bytes(b)))
            }
            Oid::DATE => fixed::<4>(data, "DATE").map(|b| PgValue::Date(i32::from_be_bytes(b))),
            Oid::TIME => fixed::<8>(data, "TIME").map(|b| PgValue::Time(i64::from_be_bytes(b))),
            Oid::JSONB => {
                // JSONB has a version byte prefix
                let body = data.get(1..).unwrap_or_default();
                Self::decode_text(Oid::JSON, body)
            }
            _ if oid.is_text_like() || oid == Oid::JSON => Self::decode_text(oid, data),
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
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

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<Uuid> for PgValue {
    fn from(v: Uuid) -> Self {
        PgValue::Uuid(v)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_UNIX_MICROS)?)
        .map(|ts| ts.naive_utc())
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(PG_EPOCH_DAYS_FROM_CE)?)
}

fn time_from_micros(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros / 1_000_000).ok()?;
    let nanos = u32::try_from((micros % 1_000_000) * 1_000).ok()?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn fixed<const N: usize>(data: &[u8], type_name: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        DriverError::TypeError(format!("Invalid {} length: {}", type_name, data.len()))
    })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(DriverError::TypeError(
            "Invalid BYTEA hex: odd number of digits".to_string(),
        ));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DriverError::TypeError(format!("Invalid BYTEA hex: {}", hex)))
        })
        .collect()
}
