//! Connection core.
//!
//! `ConnectionInner` owns one transport handle and runs every operation as a
//! blocking sequence on the calling worker thread:
//! - claim the connection through the state machine (busy / drain / idle)
//! - marshal parameters and send the command
//! - classify the first reply into no-data, a row stream, or an error
//!
//! The transport sits behind its own lock, separate from the state lock, so
//! state transitions never wait on the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::config::NO_CONNECTION_PARAMETERS;
use super::dialect::Dialect;
use super::params::ParamBuffers;
use super::state::{Begin, ConnectionState, StateMachine, StreamCursor};
use super::statement::{prepare_outcome, PreparedStatement, StatementCache, StatementRegistry};
use super::stream::ResultStream;
use super::transport::{Connector, RawRow, Reply, Transport};
use super::types::PgValue;
use crate::error::{DriverError, Result};
use crate::executor::{QueryResult, ReleaseHook};

/// Context used in error messages for prepared statement executions.
pub(crate) fn prepared_context(name: &str) -> String {
    format!("Execution of prepared statement {}", name)
}

fn no_result(query: &str, transport_error: &str) -> DriverError {
    let mut message = format!("No result returned for query: {}.", query);
    if !transport_error.is_empty() {
        message.push_str(&format!(" Error: {}.", transport_error));
    }
    DriverError::NoResultError(message)
}

fn execution_error(query: &str, server_error: &str) -> DriverError {
    DriverError::DatabaseError(format!(
        "Query execution error:\n{} For query: {}",
        server_error, query
    ))
}

/// Send a command and wait for its first reply. `Ok(Some(row))` means rows
/// are streaming; `Ok(None)` means the command finished without rows.
fn exchange<F>(transport: &mut dyn Transport, query: &str, send: F) -> Result<Option<RawRow>>
where
    F: FnOnce(&mut dyn Transport) -> std::result::Result<(), String>,
{
    if let Err(text) = send(&mut *transport) {
        transport.cancel_or_drain();
        return Err(no_result(query, &text));
    }

    if !transport.set_single_row_mode() {
        warn!(query, "Could not switch to single-row mode");
    }

    match transport.next_result() {
        None => Err(no_result(query, &transport.error_message())),
        Some(Reply::CommandOk) | Some(Reply::TuplesOk) => {
            transport.cancel_or_drain();
            Ok(None)
        }
        Some(Reply::Error(text)) => {
            transport.cancel_or_drain();
            debug!(query, error = %text, "Command failed");
            Err(execution_error(query, &text))
        }
        Some(Reply::SingleTuple(first)) => Ok(Some(first)),
    }
}

// ============================================================================
// Connection
// ============================================================================

pub(crate) struct ConnectionInner {
    /// The open transport; `None` while disconnected
    pub(crate) transport: Mutex<Option<Box<dyn Transport>>>,
    pub(crate) state: StateMachine,
    pub(crate) in_transaction: AtomicBool,
    pub(crate) dialect: &'static Dialect,
    connected: AtomicBool,
    registry: Mutex<StatementRegistry>,
    cache: Mutex<StatementCache>,
    /// Names the cache evicted that are still registered on the transport
    evicted: Mutex<Vec<String>>,
    release_hook: Mutex<Option<Arc<dyn ReleaseHook>>>,
    connector: Arc<dyn Connector>,
    conninfo: String,
}

impl ConnectionInner {
    pub(crate) fn new(connector: Arc<dyn Connector>, conninfo: String, cache_capacity: usize) -> Self {
        Self {
            transport: Mutex::new(None),
            state: StateMachine::new(),
            in_transaction: AtomicBool::new(false),
            dialect: Dialect::postgres(),
            connected: AtomicBool::new(false),
            registry: Mutex::new(StatementRegistry::new()),
            cache: Mutex::new(StatementCache::new(cache_capacity)),
            evicted: Mutex::new(Vec::new()),
            release_hook: Mutex::new(None),
            connector,
            conninfo,
        }
    }

    #[inline]
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    pub(crate) fn is_prepared(&self, name: &str) -> bool {
        self.registry.lock().is_registered(name)
    }

    pub(crate) fn set_release_hook(&self, hook: Option<Arc<dyn ReleaseHook>>) {
        *self.release_hook.lock() = hook;
    }

    pub(crate) fn take_release_hook(&self) -> Option<Arc<dyn ReleaseHook>> {
        self.release_hook.lock().take()
    }

    fn reset_session(&self) {
        self.registry.lock().clear();
        self.cache.lock().clear();
        self.evicted.lock().clear();
        self.in_transaction.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open a transport, replacing any open one.
    pub(crate) fn connect(&self) -> QueryResult {
        if self.conninfo.trim().is_empty() {
            return QueryResult::Error(DriverError::ConnectionError(
                NO_CONNECTION_PARAMETERS.to_string(),
            ));
        }

        if let Err(e) = self.claim() {
            return QueryResult::Error(e);
        }

        let opened = self.connector.connect(&self.conninfo);
        let mut guard = self.transport.lock();
        if let Some(mut old) = guard.take() {
            old.close();
        }
        self.reset_session();

        let result = match opened {
            Ok(transport) => {
                *guard = Some(transport);
                self.connected.store(true, Ordering::Release);
                info!("Connection established");
                QueryResult::NoData
            }
            Err(text) => {
                self.connected.store(false, Ordering::Release);
                warn!(error = %text, "Connection failed");
                QueryResult::Error(DriverError::ConnectionError(text))
            }
        };
        drop(guard);
        self.state.set_idle();
        result
    }

    /// Close the transport. Statement registrations and the transaction flag
    /// belong to the closed session and are dropped with it.
    pub(crate) fn close(&self) {
        let mut guard = self.transport.lock();
        if let Some(mut transport) = guard.take() {
            transport.close();
            info!("Connection closed");
        }
        self.connected.store(false, Ordering::Release);
        self.reset_session();
        drop(guard);
        self.state.set_idle();
    }

    // ------------------------------------------------------------------------
    // Operation ownership
    // ------------------------------------------------------------------------

    /// Claim the state machine, draining an abandoned stream if needed.
    fn claim(&self) -> Result<()> {
        if self.state.begin_operation()? == Begin::Drain {
            if let Some(transport) = self.transport.lock().as_mut() {
                transport.cancel_or_drain();
            }
        }
        Ok(())
    }

    /// Begin an operation that needs an open transport.
    pub(crate) fn begin(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(DriverError::disconnected());
        }
        self.claim()
    }

    /// Give up an operation that unwound while owning the connection:
    /// discard whatever the transport still holds and return to idle.
    pub(crate) fn abandon_operation(&self) {
        if !self.state.is_claimed_here() {
            return;
        }
        warn!("Abandoning operation that did not complete");
        if let Some(transport) = self.transport.lock().as_mut() {
            transport.cancel_or_drain();
        }
        self.state.set_idle();
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Execute command text with positional parameters.
    pub(crate) fn execute_text(
        self: &Arc<Self>,
        command: &str,
        params: &[Option<PgValue>],
    ) -> QueryResult {
        let buffers = ParamBuffers::marshal(params);
        if let Err(e) = self.begin() {
            return QueryResult::Error(e);
        }
        trace!(query = command, params = buffers.len(), "Executing command");
        self.dispatch(command, |transport| {
            transport.send_command(command, buffers.slots())
        })
    }

    /// Execute a prepared statement, registering it first if this connection
    /// has not seen its name yet.
    pub(crate) fn execute_prepared(
        self: &Arc<Self>,
        statement: &PreparedStatement,
        params: &[Option<PgValue>],
    ) -> QueryResult {
        let buffers = ParamBuffers::marshal(params);
        if let Err(e) = self.begin() {
            return QueryResult::Error(e);
        }
        self.deallocate_evicted();
        if let Err(text) = self.ensure_owned(statement) {
            self.state.set_idle();
            return QueryResult::Error(DriverError::DatabaseError(text));
        }
        let context = prepared_context(&statement.name);
        self.dispatch(&context, |transport| {
            transport.send_prepared(&statement.name, buffers.slots())
        })
    }

    /// Execute command text through a cached prepared statement.
    pub(crate) fn execute_cached(
        self: &Arc<Self>,
        command: &str,
        params: &[Option<PgValue>],
    ) -> QueryResult {
        let statement = {
            let mut cache = self.cache.lock();
            match cache.get_and_touch(command) {
                Some(statement) => statement,
                None => {
                    let statement = Arc::new(PreparedStatement::new(command));
                    if let Some(evicted) = cache.insert(Arc::clone(&statement)) {
                        trace!(statement = %evicted, "Evicted cached statement");
                        self.evicted.lock().push(evicted);
                    }
                    statement
                }
            }
        };
        self.execute_prepared(&statement, params)
    }

    /// Send with `send`, then classify the first reply. The caller must own
    /// the operation.
    fn dispatch<F>(self: &Arc<Self>, query: &str, send: F) -> QueryResult
    where
        F: FnOnce(&mut dyn Transport) -> std::result::Result<(), String>,
    {
        let outcome = {
            let mut guard = self.transport.lock();
            match guard.as_mut() {
                None => Err(DriverError::disconnected()),
                Some(transport) => exchange(&mut **transport, query, send),
            }
        };

        match outcome {
            Ok(Some(first)) => {
                let cursor = StreamCursor::new();
                self.state.start_streaming(&cursor);
                QueryResult::Rows(ResultStream::new(
                    Arc::downgrade(self),
                    cursor,
                    first,
                    query.to_string(),
                ))
            }
            Ok(None) => {
                self.state.set_idle();
                QueryResult::NoData
            }
            Err(e) => {
                self.state.set_idle();
                QueryResult::Error(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------------

    /// Register `statement` on this connection unless it already is. A
    /// rejected prepare carries the server's error text as is.
    pub(crate) fn ensure(&self, statement: &PreparedStatement) -> Result<()> {
        if self.registry.lock().is_registered(&statement.name) {
            return Ok(());
        }
        self.begin()?;
        let outcome = self.ensure_owned(statement);
        self.state.set_idle();
        outcome.map_err(DriverError::NoResultError)
    }

    /// `ensure` for a caller that already owns the operation.
    fn ensure_owned(&self, statement: &PreparedStatement) -> std::result::Result<(), String> {
        if self.registry.lock().is_registered(&statement.name) {
            return Ok(());
        }

        let mut guard = self.transport.lock();
        let transport = guard
            .as_mut()
            .ok_or_else(|| crate::error::DISCONNECTED_MESSAGE.to_string())?;
        let reply = transport.prepare(&statement.name, &statement.query);
        prepare_outcome(reply, || transport.error_message())?;
        drop(guard);

        self.registry.lock().mark_registered(&statement.name);
        debug!(statement = %statement.name, "Registered prepared statement");
        Ok(())
    }

    /// Drop the server-side registrations of statements the cache evicted.
    /// The caller must own the operation.
    fn deallocate_evicted(&self) {
        let names = std::mem::take(&mut *self.evicted.lock());
        if names.is_empty() {
            return;
        }
        let mut guard = self.transport.lock();
        let Some(transport) = guard.as_mut() else {
            return;
        };
        let mut registry = self.registry.lock();
        for name in names {
            if registry.forget(&name) {
                transport.deallocate(&name);
                debug!(statement = %name, "Deallocated evicted statement");
            }
        }
    }

    /// Create and register a statement for `command`, returning its handle.
    pub(crate) fn prepare(&self, command: &str) -> Result<PreparedStatement> {
        let statement = PreparedStatement::new(command);
        self.ensure(&statement)?;
        self.registry.lock().add_handle(&statement.name);
        Ok(statement)
    }

    /// Forget a handle. No transport call is made.
    pub(crate) fn release_prepared(&self, statement: &PreparedStatement) -> QueryResult {
        self.registry.lock().release_handle(&statement.name);
        trace!(statement = %statement.name, "Released prepared statement handle");
        QueryResult::NoData
    }
}
