//! PostgreSQL connection core.
//!
//! Architecture:
//! - `transport`: seam to the blocking client library
//! - `wire`: the PostgreSQL transport (`protocol` messages, `auth`)
//! - `params`: parameter marshalling
//! - `statement`: prepared statement registry and cache
//! - `state`: single-flight connection state machine
//! - `stream`: row-at-a-time result streaming
//! - `transaction`: transaction and savepoint commands
//! - `connection`: the dispatcher tying them together
//! - `dialect`: dialect rules and the query build policy
//! - `config`: connection parameters
//! - `types`: PostgreSQL value decoding

pub mod auth;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod params;
pub mod protocol;
pub mod state;
pub mod statement;
pub mod stream;
pub mod transaction;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
mod tests;

pub use config::{ConnectOption, ConnectionConfig};
pub use dialect::{Dialect, Query, ReturningId, Substitution};
pub use params::Params;
pub use state::ConnectionState;
pub use statement::PreparedStatement;
pub use stream::ResultStream;
pub use transport::{Column, Connector, Format, RawRow, Reply, Transport};
pub use types::{Oid, PgValue};
pub use wire::PgConnector;
