//! Bundled SQLite transport.
//!
//! Backs the connection core with an embedded SQLite database (rusqlite,
//! bundled library), so it can run without a PostgreSQL server. Rows are
//! streamed one at a time from a worker thread.

pub mod transport;
pub mod types;


pub use transport::{SqliteConnector, SqliteTransport};
