//! Row-at-a-time result streaming.
//!
//! A `ResultStream` is handed out when a command's first row arrives in
//! single-row mode. Each pull asks the transport for one more reply; nothing
//! is buffered beyond the current row.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::connection::ConnectionInner;
use super::state::StreamCursor;
use super::transport::{RawRow, Reply};
use crate::error::{DriverError, Result};
use crate::executor::{ReleaseHook, Row};

/// A lazy, forward-only sequence of rows bound to one connection operation.
///
/// The stream does not own its connection. Exhausting it, closing it, or
/// hitting an error returns the connection to idle; starting another
/// operation on the connection first discards whatever the stream left
/// unread, after which the stream only reports its end.
pub struct ResultStream {
    connection: Weak<ConnectionInner>,
    cursor: Arc<StreamCursor>,
    titles: Arc<[String]>,
    query: String,
    pending: Option<RawRow>,
    release: Option<Arc<dyn ReleaseHook>>,
}

impl ResultStream {
    pub(crate) fn new(
        connection: Weak<ConnectionInner>,
        cursor: Arc<StreamCursor>,
        first: RawRow,
        query: String,
    ) -> Self {
        let titles: Arc<[String]> = first.columns.iter().map(|c| c.name.clone()).collect();
        Self {
            connection,
            cursor,
            titles,
            query,
            pending: Some(first),
            release: None,
        }
    }

    pub(crate) fn set_release_hook(&mut self, hook: Option<Arc<dyn ReleaseHook>>) {
        self.release = hook;
    }

    /// Column names, in result order.
    pub fn titles(&self) -> &Arc<[String]> {
        &self.titles
    }

    /// Whether further pulls may still reach the transport.
    pub fn has_more_rows(&self) -> bool {
        self.cursor.has_more_rows()
    }

    /// Stop reading. If the stream is still the connection's active one, the
    /// unread rows are discarded and the connection returns to idle.
    pub fn close(&mut self) {
        self.pending = None;
        if self.cursor.has_more_rows() {
            self.cursor.stop();
            if let Some(conn) = self.connection.upgrade() {
                if conn.state.claim_stream(&self.cursor) {
                    debug!(query = %self.query, "Closing result stream before exhaustion");
                    if let Some(transport) = conn.transport.lock().as_mut() {
                        transport.cancel_or_drain();
                    }
                    conn.state.set_idle();
                }
            }
        }
        self.fire_release();
    }

    /// Collect the remaining rows, stopping at the first error.
    pub fn collect_rows(self) -> Result<Vec<Row>> {
        self.collect()
    }

    fn fire_release(&mut self) {
        if let Some(hook) = self.release.take() {
            hook.release();
        }
    }

    fn fetch(&mut self) -> Option<Reply> {
        let conn = self.connection.upgrade()?;
        let mut transport = conn.transport.lock();

        // Re-checked under the transport lock: a forced drain stops the
        // cursor before it takes this lock.
        if !self.cursor.has_more_rows() {
            return None;
        }

        let Some(transport) = transport.as_mut() else {
            self.cursor.stop();
            conn.state.finish_stream(&self.cursor);
            return None;
        };

        let reply = transport.next_result();
        if reply.as_ref().map_or(true, Reply::is_terminal) {
            transport.cancel_or_drain();
            self.cursor.stop();
            conn.state.finish_stream(&self.cursor);
            trace!(query = %self.query, "Result stream exhausted");
        }
        reply
    }
}

impl Iterator for ResultStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        // A stopped cursor also discards the first row if it was never read.
        if !self.cursor.has_more_rows() {
            self.pending = None;
            self.fire_release();
            return None;
        }
        if let Some(raw) = self.pending.take() {
            return Some(Row::decode(&self.titles, raw));
        }

        match self.fetch() {
            Some(Reply::SingleTuple(raw)) => Some(Row::decode(&self.titles, raw)),
            Some(Reply::Error(text)) => {
                self.cursor.stop();
                self.fire_release();
                debug!(query = %self.query, error = %text, "Result stream failed");
                Some(Err(DriverError::DatabaseError(format!(
                    "Query execution error:\n{} For query: {}",
                    text, self.query
                ))))
            }
            Some(Reply::CommandOk) | Some(Reply::TuplesOk) | None => {
                self.cursor.stop();
                self.fire_release();
                None
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        // The connection stays parked until its next operation drains it.
        self.fire_release();
    }
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("titles", &self.titles)
            .field("query", &self.query)
            .field("has_more_rows", &self.has_more_rows())
            .finish()
    }
}
