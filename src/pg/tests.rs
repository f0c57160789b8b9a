//! Tests for the connection core against a scripted transport.
//!
//! The scripted transport replays canned replies and records every call, so
//! tests can assert which transport primitives an operation used.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::dialect::{Dialect, Query, ReturningId};
use super::params::ParamSlot;
use super::statement::PreparedStatement;
use super::transport::{Column, Connector, RawRow, Reply, Transport};
use super::types::{Oid, PgValue};
use super::{ConnectionState, Params};
use crate::error::{DriverError, BUSY_MESSAGE};
use crate::executor::{Connection, QueryResult, ReleaseHook};

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Send(String, Vec<ParamSlot>),
    Prepare(String, String),
    SendPrepared(String, Vec<ParamSlot>),
    Deallocate(String),
    SingleRowMode,
    Next,
    Drain,
    Close,
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    /// Replies for each command, in send order
    responses: VecDeque<Vec<Reply>>,
    /// Replies for prepare calls; `CommandOk` when empty
    prepare_replies: VecDeque<Reply>,
    current: VecDeque<Reply>,
    error_message: String,
    connects: usize,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Script>>);

impl Shared {
    fn respond(&self, replies: Vec<Reply>) {
        self.0.lock().responses.push_back(replies);
    }

    fn respond_to_prepare(&self, reply: Reply) {
        self.0.lock().prepare_replies.push_back(reply);
    }

    fn set_error_message(&self, text: &str) {
        self.0.lock().error_message = text.to_string();
    }

    fn calls(&self) -> Vec<Call> {
        self.0.lock().calls.clone()
    }

    fn clear_calls(&self) {
        self.0.lock().calls.clear();
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn position(&self, call: &Call) -> Option<usize> {
        self.0.lock().calls.iter().position(|c| c == call)
    }
}

/// Blocks the first `next_result` until released.
struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

struct ScriptedTransport {
    shared: Shared,
    gate: Option<Gate>,
}

impl Transport for ScriptedTransport {
    fn send_command(&mut self, command: &str, params: &[ParamSlot]) -> Result<(), String> {
        if command == CRASHING_COMMAND {
            panic!("transport crashed");
        }
        let mut script = self.shared.0.lock();
        script
            .calls
            .push(Call::Send(command.to_string(), params.to_vec()));
        script.current = script.responses.pop_front().unwrap_or_default().into();
        Ok(())
    }

    fn prepare(&mut self, name: &str, command: &str) -> Reply {
        let mut script = self.shared.0.lock();
        script
            .calls
            .push(Call::Prepare(name.to_string(), command.to_string()));
        script.prepare_replies.pop_front().unwrap_or(Reply::CommandOk)
    }

    fn deallocate(&mut self, name: &str) {
        self.shared.0.lock().calls.push(Call::Deallocate(name.to_string()));
    }

    fn send_prepared(&mut self, name: &str, params: &[ParamSlot]) -> Result<(), String> {
        let mut script = self.shared.0.lock();
        script
            .calls
            .push(Call::SendPrepared(name.to_string(), params.to_vec()));
        script.current = script.responses.pop_front().unwrap_or_default().into();
        Ok(())
    }

    fn set_single_row_mode(&mut self) -> bool {
        self.shared.0.lock().calls.push(Call::SingleRowMode);
        true
    }

    fn next_result(&mut self) -> Option<Reply> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        let mut script = self.shared.0.lock();
        script.calls.push(Call::Next);
        script.current.pop_front()
    }

    fn cancel_or_drain(&mut self) {
        let mut script = self.shared.0.lock();
        script.calls.push(Call::Drain);
        script.current.clear();
    }

    fn error_message(&self) -> String {
        self.shared.0.lock().error_message.clone()
    }

    fn close(&mut self) {
        self.shared.0.lock().calls.push(Call::Close);
    }
}

#[derive(Default)]
struct ScriptedConnector {
    shared: Shared,
    gate: Mutex<Option<Gate>>,
}

impl Connector for ScriptedConnector {
    fn connect(&self, _conninfo: &str) -> Result<Box<dyn Transport>, String> {
        self.shared.0.lock().connects += 1;
        Ok(Box::new(ScriptedTransport {
            shared: self.shared.clone(),
            gate: self.gate.lock().take(),
        }))
    }
}

struct RefusingConnector;

impl Connector for RefusingConnector {
    fn connect(&self, _conninfo: &str) -> Result<Box<dyn Transport>, String> {
        Err("could not connect to server: Connection refused".to_string())
    }
}

#[derive(Default)]
struct CountingHook(AtomicUsize);

impl ReleaseHook for CountingHook {
    fn release(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl CountingHook {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

const CONNINFO: &str = "host=localhost port=5432 dbname=test";

/// Makes the scripted transport panic inside `send_command`.
const CRASHING_COMMAND: &str = "SELECT crash()";

fn row(names: &[&str], values: &[Option<&str>]) -> Reply {
    let columns = names.iter().map(|n| Column::text(*n, Oid::TEXT)).collect();
    Reply::SingleTuple(RawRow {
        columns: Arc::new(columns),
        values: values
            .iter()
            .map(|v| v.map(|s| Bytes::copy_from_slice(s.as_bytes())))
            .collect(),
    })
}

fn int_row(value: i32) -> Reply {
    Reply::SingleTuple(RawRow {
        columns: Arc::new(vec![Column::text("n", Oid::INT4)]),
        values: vec![Some(Bytes::from(value.to_string()))],
    })
}

async fn connected() -> (Connection, Shared) {
    let connector = Arc::new(ScriptedConnector::default());
    let shared = connector.shared.clone();
    let conn = Connection::new(connector, CONNINFO);
    assert!(matches!(conn.connect().await, QueryResult::NoData));
    shared.clear_calls();
    (conn, shared)
}

/// Poll `check` until it holds. Release hooks fire on the worker after the
/// awaited result was handed over.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn expect_error(result: QueryResult) -> DriverError {
    match result {
        QueryResult::Error(e) => e,
        other => panic!("expected an error, got {:?}", other),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let conn = Connection::new(Arc::new(ScriptedConnector::default()), CONNINFO);
        assert!(!conn.is_connected());

        let err = expect_error(conn.execute("SELECT 1", Params::none()).await);
        assert_eq!(err, DriverError::disconnected());
        let err = expect_error(conn.start_transaction().await);
        assert_eq!(err, DriverError::disconnected());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_parameters_rejected() {
        let connector = Arc::new(ScriptedConnector::default());
        let shared = connector.shared.clone();
        let conn = Connection::new(connector, "  ");

        let err = expect_error(conn.connect().await);
        assert_eq!(
            err,
            DriverError::ConnectionError("No connection parameters.".to_string())
        );
        assert_eq!(shared.0.lock().connects, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_connection_closed() {
        let conn = Connection::new(Arc::new(RefusingConnector), CONNINFO);
        let err = expect_error(conn.connect().await);
        assert!(matches!(err, DriverError::ConnectionError(m) if m.contains("refused")));
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_close_discards_session_state() {
        let (conn, shared) = connected().await;
        let statement = conn.prepare_statement("SELECT 1").await.unwrap();
        shared.respond(vec![Reply::CommandOk]);
        assert!(conn.start_transaction().await.is_success());
        assert!(conn.is_prepared(&statement));
        assert!(conn.in_transaction());

        assert!(matches!(conn.close().await, QueryResult::NoData));
        assert!(!conn.is_connected());
        assert!(!conn.is_prepared(&statement));
        assert!(!conn.in_transaction());
        assert!(shared.calls().contains(&Call::Close));

        // A new session registers the statement again
        assert!(conn.connect().await.is_success());
        shared.respond(vec![Reply::CommandOk]);
        assert!(conn.execute_prepared(&statement, Params::none()).await.is_success());
        assert_eq!(shared.count(|c| matches!(c, Call::Prepare(..))), 2);
    }
}

// ============================================================================
// Commands and streaming
// ============================================================================

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_select_streams_then_returns_idle() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(1), Reply::TuplesOk]);

        let stream = conn
            .execute("SELECT 1", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert_eq!(conn.state(), ConnectionState::StreamingResults);
        assert_eq!(stream.titles().to_vec(), vec!["n".to_string()]);

        let rows = stream.collect_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values(), &[PgValue::Int4(1)]);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_command_without_rows_is_no_data() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::CommandOk]);
        assert!(matches!(
            conn.execute("CREATE TABLE t (id int)", Params::none()).await,
            QueryResult::NoData
        ));

        // An empty result set in single-row mode is also no data
        shared.respond(vec![Reply::TuplesOk]);
        assert!(matches!(
            conn.execute("SELECT * FROM t", Params::none()).await,
            QueryResult::NoData
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(shared.count(|c| *c == Call::SingleRowMode), 2);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_sent_as_null() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::CommandOk]);

        let params = Params::Positional(vec![
            Some(PgValue::Int4(7)),
            None,
            Some(PgValue::Text(String::new())),
        ]);
        let sql = "INSERT INTO t (a, b, c) VALUES ($1, $2, $3)";
        assert!(conn.execute(sql, params).await.is_success());

        assert_eq!(
            shared.calls()[0],
            Call::Send(
                sql.to_string(),
                vec![Some(Bytes::from_static(b"7")), None, Some(Bytes::new())]
            )
        );
    }

    #[tokio::test]
    async fn test_named_parameters_rejected_without_transport_call() {
        let (conn, shared) = connected().await;

        let err = expect_error(
            conn.execute("SELECT $1", Params::named([("id", Some(1))]))
                .await,
        );
        assert_eq!(
            err,
            DriverError::UnsupportedError(
                "Named parameters in raw queries are not supported in PostgreSQL".to_string()
            )
        );

        let statement = PreparedStatement::new("SELECT $1");
        let err = expect_error(
            conn.execute_prepared(&statement, Params::named([("id", Some(1))]))
                .await,
        );
        assert_eq!(
            err.message(),
            "Named parameters in prepared statements are not supported in PostgreSQL"
        );

        assert!(shared.calls().is_empty());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_server_error_carries_query() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::Error(
            "ERROR:  relation \"nope\" does not exist".to_string(),
        )]);

        let err = expect_error(conn.execute("SELECT * FROM nope", Params::none()).await);
        assert_eq!(
            err,
            DriverError::DatabaseError(
                "Query execution error:\nERROR:  relation \"nope\" does not exist For query: SELECT * FROM nope"
                    .to_string()
            )
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_no_reply_is_no_result() {
        let (conn, shared) = connected().await;
        shared.respond(vec![]);
        let err = expect_error(conn.execute("SELECT 1", Params::none()).await);
        assert_eq!(
            err,
            DriverError::NoResultError("No result returned for query: SELECT 1.".to_string())
        );

        shared.respond(vec![]);
        shared.set_error_message("server closed the connection unexpectedly");
        let err = expect_error(conn.execute("SELECT 1", Params::none()).await);
        assert_eq!(
            err.message(),
            "No result returned for query: SELECT 1. Error: server closed the connection unexpectedly."
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_error_mid_stream_goes_to_consumer() {
        let (conn, shared) = connected().await;
        shared.respond(vec![
            row(&["a"], &[Some("x")]),
            Reply::Error("canceling statement due to user request".to_string()),
        ]);

        let mut stream = conn
            .execute("SELECT a FROM big", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, DriverError::DatabaseError(m) if m.contains("canceling statement")));
        assert!(stream.next().is_none());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_busy_while_command_running() {
        let connector = Arc::new(ScriptedConnector::default());
        let shared = connector.shared.clone();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *connector.gate.lock() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        let conn = Connection::new(connector, CONNINFO);
        assert!(conn.connect().await.is_success());

        shared.respond(vec![Reply::CommandOk]);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        conn.execute_with("UPDATE t SET a = 1", Params::none(), move |result| {
            let _ = done_tx.send(result);
        });
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::RunningCommand);

        let err = expect_error(conn.execute("SELECT 1", Params::none()).await);
        assert_eq!(err, DriverError::BusyError(BUSY_MESSAGE.to_string()));
        let err = expect_error(conn.commit().await);
        assert!(err.is_busy() || matches!(err, DriverError::TransactionError(_)));

        release_tx.send(()).unwrap();
        assert!(matches!(done_rx.await.unwrap(), QueryResult::NoData));
        assert_eq!(conn.state(), ConnectionState::Idle);
        // The rejected operation never reached the transport
        assert_eq!(shared.count(|c| matches!(c, Call::Send(..))), 1);
    }

    #[tokio::test]
    async fn test_new_operation_drains_abandoned_stream() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(1), int_row(2), int_row(3), Reply::TuplesOk]);
        shared.respond(vec![Reply::CommandOk]);

        let mut stream = conn
            .execute("SELECT n FROM big", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert_eq!(stream.next().unwrap().unwrap().values(), &[PgValue::Int4(1)]);
        assert_eq!(stream.next().unwrap().unwrap().values(), &[PgValue::Int4(2)]);

        assert!(matches!(
            conn.execute("DELETE FROM big", Params::none()).await,
            QueryResult::NoData
        ));

        let drain = shared.position(&Call::Drain).expect("drained");
        let second = shared
            .position(&Call::Send("DELETE FROM big".to_string(), vec![]))
            .expect("sent");
        assert!(drain < second);

        // The superseded stream ends without touching the transport
        let before = shared.count(|c| *c == Call::Next);
        assert!(!stream.has_more_rows());
        assert!(stream.next().is_none());
        assert_eq!(shared.count(|c| *c == Call::Next), before);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_closing_stream_early_returns_idle() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(1), int_row(2), Reply::TuplesOk]);

        let mut stream = conn
            .execute("SELECT n FROM big", Params::none())
            .await
            .into_rows()
            .expect("rows");
        stream.close();

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(shared.calls().contains(&Call::Drain));
        assert!(stream.next().is_none());
    }

    #[tokio::test]
    async fn test_dropped_stream_parks_until_next_operation() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(1), int_row(2), Reply::TuplesOk]);
        shared.respond(vec![Reply::CommandOk]);

        drop(conn.execute("SELECT n FROM big", Params::none()).await);
        assert_eq!(conn.state(), ConnectionState::StreamingResults);

        assert!(conn.execute("SELECT 2", Params::none()).await.is_success());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(shared.calls().contains(&Call::Drain));
    }

    #[tokio::test]
    async fn test_out_of_range_date_parameter_is_sent_as_number() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::CommandOk]);
        shared.respond(vec![int_row(1), Reply::TuplesOk]);

        let result = conn
            .execute(
                "INSERT INTO t (d) VALUES ($1)",
                Params::from(vec![PgValue::Date(i32::MAX)]),
            )
            .await;
        assert!(matches!(result, QueryResult::NoData));
        assert_eq!(
            shared.calls()[0],
            Call::Send(
                "INSERT INTO t (d) VALUES ($1)".to_string(),
                vec![Some(Bytes::from(i32::MAX.to_string()))]
            )
        );

        assert!(conn.execute("SELECT 1", Params::none()).await.is_success());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_panicking_operation_releases_connection() {
        let (conn, shared) = connected().await;

        let err = expect_error(conn.execute(CRASHING_COMMAND, Params::none()).await);
        assert_eq!(
            err,
            DriverError::NoResultError("No result from execute".to_string())
        );
        assert_eq!(conn.state(), ConnectionState::Idle);

        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.execute_with(CRASHING_COMMAND, Params::none(), move |result| {
            let _ = tx.send(result);
        });
        assert!(matches!(
            rx.await.unwrap(),
            QueryResult::Error(DriverError::NoResultError(_))
        ));

        shared.respond(vec![Reply::CommandOk]);
        assert!(conn.execute("SELECT 1", Params::none()).await.is_success());
    }

    #[tokio::test]
    async fn test_drained_stream_discards_unread_first_row() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(1), int_row(2), Reply::TuplesOk]);
        shared.respond(vec![Reply::CommandOk]);

        let mut stream = conn
            .execute("SELECT n FROM big", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert!(stream.has_more_rows());

        assert!(conn.execute("DELETE FROM big", Params::none()).await.is_success());

        assert!(!stream.has_more_rows());
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert_eq!(conn.state(), ConnectionState::Idle);
    }
}

// ============================================================================
// Prepared statements
// ============================================================================

mod prepared {
    use super::*;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (conn, shared) = connected().await;
        let statement = conn.prepare_statement("SELECT $1").await.unwrap();
        assert!(statement.name.starts_with("__pgkit_"));
        assert!(conn.is_prepared(&statement));

        shared.respond(vec![Reply::CommandOk]);
        shared.respond(vec![Reply::CommandOk]);
        let params = || Params::Positional(vec![Some(PgValue::Int4(1))]);
        assert!(conn.execute_prepared(&statement, params()).await.is_success());
        assert!(conn.execute_prepared(&statement, params()).await.is_success());

        assert_eq!(shared.count(|c| matches!(c, Call::Prepare(..))), 1);
        assert_eq!(
            shared.count(|c| matches!(c, Call::SendPrepared(name, _) if *name == statement.name)),
            2
        );
    }

    #[tokio::test]
    async fn test_prepare_failure_keeps_server_text() {
        let (conn, shared) = connected().await;
        shared.respond_to_prepare(Reply::Error("syntax error at or near \"SELEC\"".to_string()));

        let err = conn.prepare_statement("SELEC 1").await.unwrap_err();
        assert_eq!(
            err,
            DriverError::NoResultError("syntax error at or near \"SELEC\"".to_string())
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_execute_prepared_registers_on_first_use() {
        let (conn, shared) = connected().await;
        let statement = PreparedStatement::new("SELECT $1");
        shared.respond_to_prepare(Reply::Error("could not determine data type".to_string()));

        let err = expect_error(conn.execute_prepared(&statement, Params::none()).await);
        assert_eq!(
            err,
            DriverError::DatabaseError("could not determine data type".to_string())
        );
        assert!(!conn.is_prepared(&statement));
        assert_eq!(shared.count(|c| matches!(c, Call::SendPrepared(..))), 0);

        shared.respond(vec![row(&["v"], &[None]), Reply::TuplesOk]);
        let rows = conn
            .execute_prepared(&statement, Params::Positional(vec![None]))
            .await
            .into_rows()
            .expect("rows")
            .collect_rows()
            .unwrap();
        assert_eq!(rows[0].get(0), Some(&PgValue::Null));
        assert!(conn.is_prepared(&statement));
    }

    #[tokio::test]
    async fn test_prepared_error_names_statement() {
        let (conn, shared) = connected().await;
        let statement = conn.prepare_statement("SELECT 1/0").await.unwrap();
        shared.respond(vec![Reply::Error("division by zero".to_string())]);

        let err = expect_error(conn.execute_prepared(&statement, Params::none()).await);
        assert_eq!(
            err.message(),
            format!(
                "Query execution error:\ndivision by zero For query: Execution of prepared statement {}",
                statement.name
            )
        );
    }

    #[tokio::test]
    async fn test_release_makes_no_transport_call() {
        let (conn, shared) = connected().await;
        let statement = conn.prepare_statement("SELECT 1").await.unwrap();
        shared.clear_calls();

        assert!(matches!(
            conn.release_prepared(&statement).await,
            QueryResult::NoData
        ));
        assert!(shared.calls().is_empty());
    }

    #[tokio::test]
    async fn test_execute_cached_prepares_once_per_text() {
        let (conn, shared) = connected().await;
        for _ in 0..3 {
            shared.respond(vec![Reply::CommandOk]);
            assert!(conn
                .execute_cached("UPDATE t SET n = n + 1", Params::none())
                .await
                .is_success());
        }
        assert_eq!(shared.count(|c| matches!(c, Call::Prepare(..))), 1);
        assert_eq!(shared.count(|c| matches!(c, Call::SendPrepared(..))), 3);
    }

    #[tokio::test]
    async fn test_execute_cached_deallocates_evicted_statements() {
        let connector = Arc::new(ScriptedConnector::default());
        let shared = connector.shared.clone();
        let conn = Connection::with_cache_capacity(connector, CONNINFO, 2);
        assert!(conn.connect().await.is_success());

        for n in 0..10 {
            shared.respond(vec![Reply::CommandOk]);
            let command = format!("SELECT {}", n);
            assert!(conn.execute_cached(command, Params::none()).await.is_success());
        }

        let calls = shared.calls();
        let prepared: Vec<String> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Prepare(name, _) => Some(name.clone()),
                _ => None,
            })
            .collect();
        let deallocated: Vec<String> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Deallocate(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(prepared.len(), 10);
        assert_eq!(deallocated, prepared[..8].to_vec());

        // An evicted text is prepared again under a new name
        shared.clear_calls();
        shared.respond(vec![Reply::CommandOk]);
        assert!(conn.execute_cached("SELECT 0", Params::none()).await.is_success());
        assert_eq!(shared.count(|c| matches!(c, Call::Prepare(..))), 1);
        assert_eq!(
            shared.calls()[0],
            Call::Deallocate(prepared[8].clone())
        );
    }
}

// ============================================================================
// Transactions
// ============================================================================

mod transactions {
    use super::*;

    #[tokio::test]
    async fn test_commit_without_start() {
        let (conn, shared) = connected().await;
        let err = expect_error(conn.commit().await);
        assert_eq!(
            err,
            DriverError::TransactionError("No transaction exists".to_string())
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.in_transaction());
        assert!(shared.calls().is_empty());

        for result in [
            conn.rollback().await,
            conn.create_savepoint("sp").await,
            conn.rollback_to_savepoint("sp").await,
            conn.release_savepoint("sp").await,
        ] {
            assert!(matches!(result, QueryResult::Error(DriverError::TransactionError(_))));
        }
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let (conn, shared) = connected().await;
        for _ in 0..4 {
            shared.respond(vec![Reply::CommandOk]);
        }

        assert!(conn.start_transaction().await.is_success());
        assert!(conn.in_transaction());
        let err = expect_error(conn.start_transaction().await);
        assert_eq!(err.message(), "Transaction already exists");

        assert!(conn.create_savepoint("sp1").await.is_success());
        assert!(conn.release_savepoint("sp1").await.is_success());
        assert!(conn.in_transaction());
        assert!(conn.commit().await.is_success());
        assert!(!conn.in_transaction());

        let sent: Vec<String> = shared
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(sql, _) => Some(sql),
                _ => None,
            })
            .collect();
        assert_eq!(
            sent,
            vec!["BEGIN", "SAVEPOINT \"sp1\"", "RELEASE SAVEPOINT \"sp1\"", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_flag_flips_only_on_acknowledgment() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::Error("out of shared memory".to_string())]);

        let err = expect_error(conn.start_transaction().await);
        assert_eq!(
            err,
            DriverError::DatabaseError(
                "Failed to start the transaction Error: out of shared memory.".to_string()
            )
        );
        assert!(!conn.in_transaction());
        assert_eq!(conn.state(), ConnectionState::Idle);

        shared.respond(vec![Reply::CommandOk]);
        shared.respond(vec![Reply::Error("could not serialize access".to_string())]);
        assert!(conn.start_transaction().await.is_success());
        let err = expect_error(conn.rollback_to_savepoint("missing").await);
        assert_eq!(
            err.message(),
            "Failed to rollback to the savepoint missing Error: could not serialize access."
        );
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn test_transaction_command_drains_open_stream() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::CommandOk]);
        shared.respond(vec![int_row(1), int_row(2), Reply::TuplesOk]);
        shared.respond(vec![Reply::CommandOk]);

        assert!(conn.start_transaction().await.is_success());
        let mut stream = conn
            .execute("SELECT n FROM t", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert!(stream.next().is_some());

        assert!(conn.rollback().await.is_success());
        assert!(!conn.in_transaction());
        assert!(stream.next().is_none());
    }
}

// ============================================================================
// Façade forms and release hook
// ============================================================================

mod facade {
    use super::*;

    struct Insert;

    impl Query for Insert {
        fn build(&self, dialect: &Dialect) -> Result<String, String> {
            Ok(format!(
                "INSERT INTO {} (name) VALUES ($1)",
                dialect.quote_identifier("users")
            ))
        }

        fn returning_id(&self) -> Option<ReturningId> {
            Some(ReturningId {
                autoincrement_keys: vec!["id".to_string()],
            })
        }
    }

    struct WithSuffix;

    impl Query for WithSuffix {
        fn build(&self, _dialect: &Dialect) -> Result<String, String> {
            Ok("INSERT INTO users (name) VALUES ($1) ON CONFLICT DO NOTHING".to_string())
        }

        fn suffix(&self) -> Option<&str> {
            Some("ON CONFLICT DO NOTHING")
        }

        fn returning_id(&self) -> Option<ReturningId> {
            Some(ReturningId {
                autoincrement_keys: vec!["id".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn test_built_query_returns_id() {
        let (conn, shared) = connected().await;
        shared.respond(vec![int_row(17), Reply::TuplesOk]);

        let rows = conn
            .execute_query(&Insert, Params::positional([Some("ada")]))
            .await
            .into_rows()
            .expect("rows")
            .collect_rows()
            .unwrap();
        assert_eq!(rows[0].values(), &[PgValue::Int4(17)]);
        assert_eq!(
            shared.calls()[0],
            Call::Send(
                "INSERT INTO \"users\" (name) VALUES ($1) RETURNING \"id\" AS id".to_string(),
                vec![Some(Bytes::from_static(b"ada"))]
            )
        );
    }

    #[tokio::test]
    async fn test_suffix_conflict_is_syntax_error() {
        let (conn, shared) = connected().await;
        let err = expect_error(conn.execute_query(&WithSuffix, Params::none()).await);
        assert_eq!(
            err,
            DriverError::SyntaxError(
                "Suffix for query already set, could not add Returning suffix".to_string()
            )
        );
        assert!(shared.calls().is_empty());
        assert!(conn.description_of(&WithSuffix).is_err());
    }

    #[tokio::test]
    async fn test_callback_runs_exactly_once() {
        let (conn, shared) = connected().await;
        shared.respond(vec![Reply::CommandOk]);

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = Arc::clone(&calls);
        conn.start_transaction_with(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        assert!(rx.await.unwrap().is_success());
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_hook_after_completion() {
        let (conn, shared) = connected().await;
        let hook = Arc::new(CountingHook::default());
        shared.respond(vec![Reply::CommandOk]);

        conn.set_release_hook(Some(hook.clone()));
        assert!(conn.execute("SELECT 1", Params::none()).await.is_success());
        assert!(eventually(|| hook.count() == 1).await);

        // One-shot: later operations do not notify again
        shared.respond(vec![Reply::CommandOk]);
        assert!(conn.execute("SELECT 1", Params::none()).await.is_success());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hook.count(), 1);
    }

    #[tokio::test]
    async fn test_release_hook_after_prepare() {
        let (conn, shared) = connected().await;
        let hook = Arc::new(CountingHook::default());

        conn.set_release_hook(Some(hook.clone()));
        assert!(conn.prepare_statement("SELECT $1").await.is_ok());
        assert!(eventually(|| hook.count() == 1).await);

        shared.respond_to_prepare(Reply::Error("syntax error".to_string()));
        conn.set_release_hook(Some(hook.clone()));
        assert!(conn.prepare_statement("SELEC $1").await.is_err());
        assert!(eventually(|| hook.count() == 2).await);
    }

    #[tokio::test]
    async fn test_release_hook_waits_for_stream_end() {
        let (conn, shared) = connected().await;
        let hook = Arc::new(CountingHook::default());
        shared.respond(vec![int_row(1), int_row(2), Reply::TuplesOk]);

        conn.set_release_hook(Some(hook.clone()));
        let mut stream = conn
            .execute("SELECT n FROM t", Params::none())
            .await
            .into_rows()
            .expect("rows");
        assert_eq!(hook.count(), 0);

        assert!(stream.next().is_some());
        assert!(stream.next().is_some());
        assert_eq!(hook.count(), 0);
        assert!(stream.next().is_none());
        assert_eq!(hook.count(), 1);

        drop(stream);
        assert_eq!(hook.count(), 1);
    }

    #[test]
    fn test_blocking_forms() {
        let connector = Arc::new(ScriptedConnector::default());
        let shared = connector.shared.clone();
        let conn = Connection::new(connector, CONNINFO);

        assert!(matches!(conn.connect_sync(), QueryResult::NoData));
        shared.respond(vec![int_row(1), Reply::TuplesOk]);
        let rows = conn
            .execute_sync("SELECT 1", Params::none())
            .into_rows()
            .expect("rows")
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);

        let err = expect_error(conn.commit_sync());
        assert_eq!(err.message(), "No transaction exists");
        assert!(conn.prepare_statement_sync("SELECT 2").is_ok());
        assert!(matches!(conn.close_sync(), QueryResult::NoData));
    }
}
