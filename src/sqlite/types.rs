//! SQLite value conversions for the transport.
//!
//! Parameters arrive as text slots and are bound as TEXT (or NULL); SQLite's
//! type affinity takes care of numeric columns. Result cells are reported
//! with the PostgreSQL type matching their storage class.

use bytes::Bytes;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};

use crate::pg::params::ParamSlot;
use crate::pg::transport::Format;
use crate::pg::types::Oid;

/// A borrowed parameter slot, bindable to a SQLite statement.
pub struct SqliteParam<'a>(pub &'a ParamSlot);

impl ToSql for SqliteParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self.0 {
            None => Ok(ToSqlOutput::Owned(Value::Null)),
            // Borrowed to avoid copying the parameter buffer
            Some(text) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(text))),
        }
    }
}

/// One result cell: its reported type, wire format and raw buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub type_oid: Oid,
    pub format: Format,
    pub data: Option<Bytes>,
}

impl Cell {
    /// Convert from rusqlite ValueRef.
    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::text(Oid::TEXT, None),
            ValueRef::Integer(i) => Self::text(Oid::INT8, Some(Bytes::from(i.to_string()))),
            ValueRef::Real(f) => Self::text(Oid::FLOAT8, Some(Bytes::from(f.to_string()))),
            ValueRef::Text(s) => Self::text(Oid::TEXT, Some(Bytes::copy_from_slice(s))),
            ValueRef::Blob(b) => Self {
                type_oid: Oid::BYTEA,
                format: Format::Binary,
                data: Some(Bytes::copy_from_slice(b)),
            },
        }
    }

    fn text(type_oid: Oid, data: Option<Bytes>) -> Self {
        Self {
            type_oid,
            format: Format::Text,
            data,
        }
    }
}
