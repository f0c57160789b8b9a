//! Execution façade.
//!
//! `Connection` is the public operation surface. Every operation comes in
//! three forms sharing one code path:
//! - `op(..).await`: resolves once the worker finished
//! - `op_with(.., callback)`: schedules the work, the callback runs exactly once
//! - `op_sync(..)`: blocks the calling thread until the result is available
//!
//! The blocking transport work always runs on a tokio blocking worker.
//! Failures are returned inside `QueryResult::Error`, never raised.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{DriverError, Result};
use crate::pg::config::ConnectionConfig;
use crate::pg::connection::ConnectionInner;
use crate::pg::dialect::{bind_parameters, build_query, Query};
use crate::pg::params::{Params, NAMED_PREPARED_UNSUPPORTED, NAMED_RAW_UNSUPPORTED};
use crate::pg::state::ConnectionState;
use crate::pg::statement::{PreparedStatement, DEFAULT_CACHE_CAPACITY};
use crate::pg::stream::ResultStream;
use crate::pg::transaction::TransactionCommand;
use crate::pg::transport::{Connector, RawRow};
use crate::pg::types::PgValue;
use crate::runtime;

// ============================================================================
// Results
// ============================================================================

/// Notified when a borrowed connection is free again, typically by a pool
/// wrapper.
pub trait ReleaseHook: Send + Sync {
    fn release(&self);
}

/// The outcome of one operation.
#[derive(Debug)]
pub enum QueryResult {
    /// Success without rows.
    NoData,
    /// Success with a single value. Not produced by this connection layer;
    /// present for wrappers that reduce a result to one value.
    Value(PgValue),
    /// Success with rows, delivered lazily.
    Rows(ResultStream),
    /// Failure.
    Error(DriverError),
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, QueryResult::Error(_))
    }

    pub fn error(&self) -> Option<&DriverError> {
        match self {
            QueryResult::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<ResultStream> {
        match self {
            QueryResult::Rows(stream) => Some(stream),
            _ => None,
        }
    }

    /// Convert into a `Result`, so `?` can be used on it.
    pub fn into_result(self) -> Result<QueryResult> {
        match self {
            QueryResult::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// One decoded row.
///
/// Uses SmallVec to inline storage for rows with ≤16 columns, avoiding heap
/// allocation for typical tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    titles: Arc<[String]>,
    values: SmallVec<[PgValue; 16]>,
}

impl Row {
    pub(crate) fn decode(titles: &Arc<[String]>, raw: RawRow) -> Result<Self> {
        let values = raw
            .columns
            .iter()
            .zip(raw.values)
            .map(|(column, cell)| match cell {
                None => Ok(PgValue::Null),
                Some(data) => PgValue::decode(column.type_oid, column.format, &data),
            })
            .collect::<Result<SmallVec<[PgValue; 16]>>>()?;
        Ok(Self {
            titles: Arc::clone(titles),
            values,
        })
    }

    pub fn titles(&self) -> &[String] {
        &self.titles
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&PgValue> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, title: &str) -> Option<&PgValue> {
        let index = self.titles.iter().position(|t| t == title)?;
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values.into_vec()
    }
}

/// A value an operation resolves to. Knows how to express a lost result and
/// how to settle with the release hook.
pub(crate) trait Outcome: Send + Sized + 'static {
    fn from_error(error: DriverError) -> Self;

    fn no_result(operation: &str) -> Self {
        Self::from_error(DriverError::NoResultError(format!(
            "No result from {}",
            operation
        )))
    }

    /// The pending release hook fires once the callback returned.
    fn settle<C: FnOnce(Self)>(self, inner: &ConnectionInner, on_completion: C) {
        let hook = inner.take_release_hook();
        on_completion(self);
        if let Some(hook) = hook {
            hook.release();
        }
    }
}

impl Outcome for QueryResult {
    fn from_error(error: DriverError) -> Self {
        QueryResult::Error(error)
    }

    /// The pending release hook fires after the callback returned, or when
    /// the stream a callback received is done.
    fn settle<C: FnOnce(Self)>(self, inner: &ConnectionInner, on_completion: C) {
        let hook = inner.take_release_hook();
        match self {
            QueryResult::Rows(mut stream) => {
                stream.set_release_hook(hook);
                on_completion(QueryResult::Rows(stream));
            }
            other => {
                on_completion(other);
                if let Some(hook) = hook {
                    hook.release();
                }
            }
        }
    }
}

impl<T: Send + 'static> Outcome for Result<T> {
    fn from_error(error: DriverError) -> Self {
        Err(error)
    }
}

type Work<T> = Box<dyn FnOnce(&Arc<ConnectionInner>) -> T + Send + 'static>;

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown panic"
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A database connection with a single-flight operation contract.
///
/// Clones share the same underlying connection. At most one operation runs
/// at a time; starting one while another waits for its result fails with
/// `DriverError::BusyError`.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.inner.is_connected())
            .field("state", &self.inner.state())
            .field("in_transaction", &self.inner.in_transaction())
            .finish()
    }
}

impl Connection {
    /// Create a disconnected connection for a `key=value` parameter string.
    pub fn new(connector: Arc<dyn Connector>, conninfo: impl Into<String>) -> Self {
        Self::with_cache_capacity(connector, conninfo, DEFAULT_CACHE_CAPACITY)
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &ConnectionConfig) -> Self {
        Self::new(connector, config.to_conninfo())
    }

    /// Like `new`, with the capacity of the `execute_cached` statement cache.
    pub fn with_cache_capacity(
        connector: Arc<dyn Connector>,
        conninfo: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner::new(connector, conninfo.into(), capacity)),
            runtime: None,
        }
    }

    /// Run operations on `handle` instead of the ambient or shared runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    /// Whether `statement` is registered on the current transport.
    pub fn is_prepared(&self, statement: &PreparedStatement) -> bool {
        self.inner.is_prepared(&statement.name)
    }

    /// Set the hook notified once after the next operation completes.
    pub fn set_release_hook(&self, hook: Option<Arc<dyn ReleaseHook>>) {
        self.inner.set_release_hook(hook);
    }

    /// The command text `query` builds to on this connection.
    pub fn description_of(&self, query: &dyn Query) -> Result<String> {
        build_query(query, self.inner.dialect)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn handle(&self) -> Result<Handle> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => runtime::current_or_shared(),
        }
    }

    fn submit<T, C>(&self, operation: &'static str, work: Work<T>, on_completion: C)
    where
        T: Outcome,
        C: FnOnce(T) + Send + 'static,
    {
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(operation, error = %e, "No runtime to run operation on");
                on_completion(T::from_error(e));
                return;
            }
        };
        let inner = Arc::clone(&self.inner);
        handle.spawn_blocking(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&inner))) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    warn!(operation, panic = panic_text(&*payload), "Operation panicked");
                    inner.abandon_operation();
                    T::no_result(operation)
                }
            };
            outcome.settle(&inner, on_completion);
        });
    }

    async fn run<T: Outcome>(&self, operation: &'static str, work: Work<T>) -> T {
        let (tx, rx) = oneshot::channel();
        self.submit(operation, work, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or_else(|_| T::no_result(operation))
    }

    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    fn run_sync<T: Outcome>(&self, operation: &'static str, work: Work<T>) -> T {
        let (tx, rx) = oneshot::channel();
        self.submit(operation, work, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.blocking_recv()
            .unwrap_or_else(|_| T::no_result(operation))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn connect(&self) -> QueryResult {
        self.run("connect", connect_work()).await
    }

    pub fn connect_with<C>(&self, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("connect", connect_work(), on_completion)
    }

    pub fn connect_sync(&self) -> QueryResult {
        self.run_sync("connect", connect_work())
    }

    pub async fn close(&self) -> QueryResult {
        self.run("close", close_work()).await
    }

    pub fn close_with<C>(&self, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("close", close_work(), on_completion)
    }

    pub fn close_sync(&self) -> QueryResult {
        self.run_sync("close", close_work())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Execute a built query.
    pub async fn execute_query(&self, query: &dyn Query, params: Params) -> QueryResult {
        let work = self.query_work(query, params);
        self.run("execute_query", work).await
    }

    pub fn execute_query_with<C>(&self, query: &dyn Query, params: Params, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        let work = self.query_work(query, params);
        self.submit("execute_query", work, on_completion)
    }

    pub fn execute_query_sync(&self, query: &dyn Query, params: Params) -> QueryResult {
        let work = self.query_work(query, params);
        self.run_sync("execute_query", work)
    }

    /// Execute raw command text. Only positional parameters are accepted.
    pub async fn execute(&self, command: impl Into<String>, params: Params) -> QueryResult {
        self.run("execute", raw_work(command.into(), params)).await
    }

    pub fn execute_with<C>(&self, command: impl Into<String>, params: Params, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("execute", raw_work(command.into(), params), on_completion)
    }

    pub fn execute_sync(&self, command: impl Into<String>, params: Params) -> QueryResult {
        self.run_sync("execute", raw_work(command.into(), params))
    }

    /// Execute a prepared statement, registering it on this connection first
    /// if needed.
    pub async fn execute_prepared(
        &self,
        statement: &PreparedStatement,
        params: Params,
    ) -> QueryResult {
        let work = prepared_work(statement.clone(), params);
        self.run("execute_prepared", work).await
    }

    pub fn execute_prepared_with<C>(
        &self,
        statement: &PreparedStatement,
        params: Params,
        on_completion: C,
    ) where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        let work = prepared_work(statement.clone(), params);
        self.submit("execute_prepared", work, on_completion)
    }

    pub fn execute_prepared_sync(&self, statement: &PreparedStatement, params: Params) -> QueryResult {
        self.run_sync("execute_prepared", prepared_work(statement.clone(), params))
    }

    /// Execute raw command text through a prepared statement cached per
    /// connection by text.
    pub async fn execute_cached(&self, command: impl Into<String>, params: Params) -> QueryResult {
        self.run("execute_cached", cached_work(command.into(), params)).await
    }

    pub fn execute_cached_with<C>(
        &self,
        command: impl Into<String>,
        params: Params,
        on_completion: C,
    ) where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("execute_cached", cached_work(command.into(), params), on_completion)
    }

    pub fn execute_cached_sync(&self, command: impl Into<String>, params: Params) -> QueryResult {
        self.run_sync("execute_cached", cached_work(command.into(), params))
    }

    fn query_work(&self, query: &dyn Query, params: Params) -> Work<QueryResult> {
        let built = build_query(query, self.inner.dialect)
            .and_then(|text| Ok((text, bind_parameters(query, params)?)));
        Box::new(move |inner: &Arc<ConnectionInner>| match built {
            Ok((text, values)) => inner.execute_text(&text, &values),
            Err(e) => QueryResult::Error(e),
        })
    }

    // ------------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------------

    /// Prepare raw command text and return its handle.
    pub async fn prepare_statement(&self, command: impl Into<String>) -> Result<PreparedStatement> {
        self.run("prepare_statement", prepare_work(Ok(command.into()))).await
    }

    pub fn prepare_statement_with<C>(&self, command: impl Into<String>, on_completion: C)
    where
        C: FnOnce(Result<PreparedStatement>) + Send + 'static,
    {
        self.submit("prepare_statement", prepare_work(Ok(command.into())), on_completion)
    }

    pub fn prepare_statement_sync(&self, command: impl Into<String>) -> Result<PreparedStatement> {
        self.run_sync("prepare_statement", prepare_work(Ok(command.into())))
    }

    /// Build `query`, prepare it, and return its handle.
    pub async fn prepare_query(&self, query: &dyn Query) -> Result<PreparedStatement> {
        let work = prepare_work(self.description_of(query));
        self.run("prepare_query", work).await
    }

    pub fn prepare_query_with<C>(&self, query: &dyn Query, on_completion: C)
    where
        C: FnOnce(Result<PreparedStatement>) + Send + 'static,
    {
        let work = prepare_work(self.description_of(query));
        self.submit("prepare_query", work, on_completion)
    }

    pub fn prepare_query_sync(&self, query: &dyn Query) -> Result<PreparedStatement> {
        self.run_sync("prepare_query", prepare_work(self.description_of(query)))
    }

    /// Release a statement handle. No command is sent to the server.
    pub async fn release_prepared(&self, statement: &PreparedStatement) -> QueryResult {
        self.run("release_prepared", release_work(statement.clone())).await
    }

    pub fn release_prepared_with<C>(&self, statement: &PreparedStatement, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("release_prepared", release_work(statement.clone()), on_completion)
    }

    pub fn release_prepared_sync(&self, statement: &PreparedStatement) -> QueryResult {
        self.run_sync("release_prepared", release_work(statement.clone()))
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub async fn start_transaction(&self) -> QueryResult {
        self.transaction(TransactionCommand::Begin).await
    }

    pub fn start_transaction_with<C>(&self, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(TransactionCommand::Begin, on_completion)
    }

    pub fn start_transaction_sync(&self) -> QueryResult {
        self.transaction_sync(TransactionCommand::Begin)
    }

    pub async fn commit(&self) -> QueryResult {
        self.transaction(TransactionCommand::Commit).await
    }

    pub fn commit_with<C>(&self, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(TransactionCommand::Commit, on_completion)
    }

    pub fn commit_sync(&self) -> QueryResult {
        self.transaction_sync(TransactionCommand::Commit)
    }

    pub async fn rollback(&self) -> QueryResult {
        self.transaction(TransactionCommand::Rollback).await
    }

    pub fn rollback_with<C>(&self, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(TransactionCommand::Rollback, on_completion)
    }

    pub fn rollback_sync(&self) -> QueryResult {
        self.transaction_sync(TransactionCommand::Rollback)
    }

    pub async fn create_savepoint(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction(TransactionCommand::CreateSavepoint(savepoint.into()))
            .await
    }

    pub fn create_savepoint_with<C>(&self, savepoint: impl Into<String>, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(
            TransactionCommand::CreateSavepoint(savepoint.into()),
            on_completion,
        )
    }

    pub fn create_savepoint_sync(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction_sync(TransactionCommand::CreateSavepoint(savepoint.into()))
    }

    pub async fn rollback_to_savepoint(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction(TransactionCommand::RollbackToSavepoint(savepoint.into()))
            .await
    }

    pub fn rollback_to_savepoint_with<C>(&self, savepoint: impl Into<String>, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(
            TransactionCommand::RollbackToSavepoint(savepoint.into()),
            on_completion,
        )
    }

    pub fn rollback_to_savepoint_sync(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction_sync(TransactionCommand::RollbackToSavepoint(savepoint.into()))
    }

    pub async fn release_savepoint(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction(TransactionCommand::ReleaseSavepoint(savepoint.into()))
            .await
    }

    pub fn release_savepoint_with<C>(&self, savepoint: impl Into<String>, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.transaction_with(
            TransactionCommand::ReleaseSavepoint(savepoint.into()),
            on_completion,
        )
    }

    pub fn release_savepoint_sync(&self, savepoint: impl Into<String>) -> QueryResult {
        self.transaction_sync(TransactionCommand::ReleaseSavepoint(savepoint.into()))
    }

    async fn transaction(&self, command: TransactionCommand) -> QueryResult {
        self.run("transaction", transaction_work(command)).await
    }

    fn transaction_with<C>(&self, command: TransactionCommand, on_completion: C)
    where
        C: FnOnce(QueryResult) + Send + 'static,
    {
        self.submit("transaction", transaction_work(command), on_completion)
    }

    fn transaction_sync(&self, command: TransactionCommand) -> QueryResult {
        self.run_sync("transaction", transaction_work(command))
    }
}

// ============================================================================
// Work items
// ============================================================================

fn connect_work() -> Work<QueryResult> {
    Box::new(|inner: &Arc<ConnectionInner>| inner.connect())
}

fn close_work() -> Work<QueryResult> {
    Box::new(|inner: &Arc<ConnectionInner>| {
        inner.close();
        QueryResult::NoData
    })
}

fn raw_work(command: String, params: Params) -> Work<QueryResult> {
    Box::new(move |inner: &Arc<ConnectionInner>| {
        match params.require_positional(NAMED_RAW_UNSUPPORTED) {
            Ok(values) => inner.execute_text(&command, values),
            Err(e) => QueryResult::Error(e),
        }
    })
}

fn prepared_work(statement: PreparedStatement, params: Params) -> Work<QueryResult> {
    Box::new(move |inner: &Arc<ConnectionInner>| {
        match params.require_positional(NAMED_PREPARED_UNSUPPORTED) {
            Ok(values) => inner.execute_prepared(&statement, values),
            Err(e) => QueryResult::Error(e),
        }
    })
}

fn cached_work(command: String, params: Params) -> Work<QueryResult> {
    Box::new(move |inner: &Arc<ConnectionInner>| {
        match params.require_positional(NAMED_RAW_UNSUPPORTED) {
            Ok(values) => inner.execute_cached(&command, values),
            Err(e) => QueryResult::Error(e),
        }
    })
}

fn prepare_work(command: Result<String>) -> Work<Result<PreparedStatement>> {
    Box::new(move |inner: &Arc<ConnectionInner>| inner.prepare(&command?))
}

fn release_work(statement: PreparedStatement) -> Work<QueryResult> {
    Box::new(move |inner: &Arc<ConnectionInner>| inner.release_prepared(&statement))
}

fn transaction_work(command: TransactionCommand) -> Work<QueryResult> {
    Box::new(move |inner: &Arc<ConnectionInner>| inner.run_transaction(&command))
}
