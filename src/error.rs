//! Error types for the pgkit driver.
//!
//! Every public operation resolves to a `QueryResult`; failures travel inside
//! its `Error` variant as a `DriverError` instead of being raised.

use thiserror::Error;

/// Message returned when an operation is attempted while another one is
/// still waiting for its result.
pub const BUSY_MESSAGE: &str = "The connection is in the middle of running a query";

/// Message returned when an operation needs a transport but none is open.
pub const DISCONNECTED_MESSAGE: &str = "Connection is disconnected";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Cannot reach or authenticate with the server, or no transport is open.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Another operation owns the connection.
    #[error("Connection busy: {0}")]
    BusyError(String),

    /// The command text could not be built.
    #[error("Syntax error: {0}")]
    SyntaxError(String),

    /// The server rejected a well-formed command.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A transaction state precondition was violated.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// The requested feature is not available on this code path.
    #[error("Unsupported: {0}")]
    UnsupportedError(String),

    /// The transport returned nothing where a result was expected.
    #[error("No result: {0}")]
    NoResultError(String),

    /// A value could not be decoded from its wire representation.
    #[error("Type conversion error: {0}")]
    TypeError(String),
}

impl DriverError {
    pub(crate) fn busy() -> Self {
        DriverError::BusyError(BUSY_MESSAGE.to_string())
    }

    pub(crate) fn disconnected() -> Self {
        DriverError::ConnectionError(DISCONNECTED_MESSAGE.to_string())
    }

    /// The message text without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            DriverError::ConnectionError(m)
            | DriverError::BusyError(m)
            | DriverError::SyntaxError(m)
            | DriverError::DatabaseError(m)
            | DriverError::TransactionError(m)
            | DriverError::UnsupportedError(m)
            | DriverError::NoResultError(m)
            | DriverError::TypeError(m) => m,
        }
    }

    /// Whether this is the "busy" rejection of a concurrent operation.
    #[inline]
    pub fn is_busy(&self) -> bool {
        matches!(self, DriverError::BusyError(_))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
