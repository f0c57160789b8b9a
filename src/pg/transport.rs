//! The blocking client library seam.
//!
//! A `Transport` is one open handle of an underlying request/response client
//! library. All methods block the calling thread; the connection core only
//! calls them from worker threads and never while holding its state lock.
//!
//! Result delivery follows the libpq model: after a command is sent, each
//! `next_result` call yields one reply, and `None` once the command has no
//! more replies. In single-row mode every row of a result set arrives as its
//! own `Reply::SingleTuple`, terminated by `Reply::TuplesOk`.

use std::sync::Arc;

use bytes::Bytes;

use super::params::ParamSlot;
use super::types::Oid;

/// Wire format of a result cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Binary,
}

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub format: Format,
}

impl Column {
    pub fn text(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
            format: Format::Text,
        }
    }
}

/// Shared column descriptions, so rows of one result do not clone them.
pub type SharedColumns = Arc<Vec<Column>>;

/// One undecoded row as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub columns: SharedColumns,
    /// Raw cell buffers; `None` is SQL NULL.
    pub values: Vec<Option<Bytes>>,
}

/// One reply to a sent command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The command completed and returns no rows.
    CommandOk,
    /// A row-returning command completed; in single-row mode this ends the
    /// stream of `SingleTuple` replies, and alone it means an empty result.
    TuplesOk,
    /// One row of a result set, in single-row mode.
    SingleTuple(RawRow),
    /// The server rejected the command.
    Error(String),
}

impl Reply {
    /// Whether this reply ends the current result.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Reply::SingleTuple(_))
    }
}

/// An open handle of the client library.
pub trait Transport: Send {
    /// Send a text command with positional parameters. Does not wait for
    /// the result.
    fn send_command(&mut self, command: &str, params: &[ParamSlot]) -> Result<(), String>;

    /// Register a named prepared statement and wait for the server's answer.
    fn prepare(&mut self, name: &str, command: &str) -> Reply;

    /// Drop a registered prepared statement and wait until it is gone.
    fn deallocate(&mut self, name: &str);

    /// Send an execution of a registered prepared statement. Does not wait
    /// for the result.
    fn send_prepared(&mut self, name: &str, params: &[ParamSlot]) -> Result<(), String>;

    /// Ask for the result of the last sent command to be delivered one row
    /// per reply. Returns false if the mode could not be switched.
    fn set_single_row_mode(&mut self) -> bool;

    /// The next reply for the last sent command, or `None` when there are
    /// no more.
    fn next_result(&mut self) -> Option<Reply>;

    /// Discard every buffered and still-pending reply of the last command.
    fn cancel_or_drain(&mut self);

    /// The most recent error text reported by the library; may be empty.
    fn error_message(&self) -> String;

    /// Close the handle. Further calls have no effect.
    fn close(&mut self);
}

/// Opens transports from a connection parameter string.
pub trait Connector: Send + Sync {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Transport>, String>;
}
