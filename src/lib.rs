//! pgkit - a streaming, single-flight PostgreSQL connection driver.
//!
//! A [`Connection`] turns a blocking request/response client library (a
//! [`Transport`](pg::Transport)) into an asynchronous engine:
//! - at most one operation in flight per connection; a second one is
//!   rejected as busy, never queued
//! - row-returning commands stream one row per pull
//! - prepared statements are registered once per connection
//! - transaction state is tracked next to the stateless command protocol
//!
//! Every operation is offered as an `async fn`, with a completion callback
//! (`*_with`), and as a blocking call (`*_sync`).
//!
//! Two transports ship with the crate: [`PgConnector`] speaks the PostgreSQL
//! wire protocol, and [`SqliteConnector`] runs the same commands on an
//! embedded SQLite database.

pub mod error;
pub mod executor;
pub mod pg;
pub mod runtime;
pub mod sqlite;

pub use error::{DriverError, Result};
pub use executor::{Connection, QueryResult, ReleaseHook, Row};
pub use pg::{ConnectionConfig, Params, PgConnector, PgValue, PreparedStatement, ResultStream};
pub use sqlite::SqliteConnector;
