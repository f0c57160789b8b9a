//! SQLite-backed transport.
//!
//! A dedicated worker thread owns the `rusqlite::Connection`. Each command
//! gets its own rendezvous channel: the worker steps the statement and hands
//! over one row per `next_result` call, so rows are produced only as fast as
//! they are consumed. Dropping the receiving end is the drain: the worker's
//! next hand-over fails and it stops stepping the statement.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, trace, warn};

use super::types::{Cell, SqliteParam};
use crate::pg::config::parse_conninfo;
use crate::pg::params::ParamSlot;
use crate::pg::transport::{Column, Connector, RawRow, Reply, Transport};

const WORKER_GONE: &str = "SQLite worker is not running";

enum Request {
    Command {
        sql: String,
        params: Vec<ParamSlot>,
        replies: SyncSender<Reply>,
    },
    Prepare {
        name: String,
        sql: String,
        done: SyncSender<Reply>,
    },
    Prepared {
        name: String,
        params: Vec<ParamSlot>,
        replies: SyncSender<Reply>,
    },
    Deallocate {
        name: String,
        done: SyncSender<()>,
    },
}

// ============================================================================
// Connector
// ============================================================================

/// Opens SQLite transports.
///
/// Recognized parameters: `dbname` is the database path (default
/// `:memory:`), `connect_timeout` becomes the busy timeout in seconds.
/// Other parameters are accepted and ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Transport>, String> {
        let pairs = parse_conninfo(conninfo).map_err(|e| e.message().to_string())?;
        let mut path = ":memory:".to_string();
        let mut busy_timeout = None;
        for (key, value) in pairs {
            match key.as_str() {
                "dbname" => path = value,
                "connect_timeout" => {
                    let secs = value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid connect_timeout: {}", value))?;
                    busy_timeout = Some(Duration::from_secs(secs));
                }
                _ => {}
            }
        }
        SqliteTransport::open(&path, busy_timeout).map(|t| Box::new(t) as Box<dyn Transport>)
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct SqliteTransport {
    requests: Option<Sender<Request>>,
    replies: Option<Receiver<Reply>>,
    worker: Option<JoinHandle<()>>,
    last_error: String,
}

impl SqliteTransport {
    /// Open a database and start its worker thread.
    ///
    /// File databases get the WAL journal and relaxed syncing.
    pub fn open(path: &str, busy_timeout: Option<Duration>) -> Result<Self, String> {
        let is_memory = path == ":memory:";
        let conn = if is_memory {
            Connection::open_in_memory()
        } else {
            Connection::open_with_flags(path, OpenFlags::default())
        }
        .map_err(|e| e.to_string())?;

        if let Some(timeout) = busy_timeout {
            conn.busy_timeout(timeout).map_err(|e| e.to_string())?;
        }
        if !is_memory {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )
            .map_err(|e| e.to_string())?;
        }

        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("pgkit-sqlite".to_string())
            .spawn(move || Worker::new(conn).run(rx))
            .map_err(|e| e.to_string())?;

        debug!(path, "SQLite transport opened");
        Ok(Self {
            requests: Some(tx),
            replies: None,
            worker: Some(worker),
            last_error: String::new(),
        })
    }

    fn submit(&mut self, request: Request) -> Result<(), String> {
        let sent = match &self.requests {
            Some(requests) => requests.send(request).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            self.last_error = WORKER_GONE.to_string();
            Err(WORKER_GONE.to_string())
        }
    }

    fn start(&mut self, request: impl FnOnce(SyncSender<Reply>) -> Request) -> Result<(), String> {
        // Anything left of the previous command is discarded
        self.replies = None;
        self.last_error.clear();
        let (tx, rx) = mpsc::sync_channel(0);
        self.submit(request(tx))?;
        self.replies = Some(rx);
        Ok(())
    }
}

impl Transport for SqliteTransport {
    fn send_command(&mut self, command: &str, params: &[ParamSlot]) -> Result<(), String> {
        self.start(|replies| Request::Command {
            sql: command.to_string(),
            params: params.to_vec(),
            replies,
        })
    }

    fn prepare(&mut self, name: &str, command: &str) -> Reply {
        self.last_error.clear();
        let (done, rx) = mpsc::sync_channel(1);
        let request = Request::Prepare {
            name: name.to_string(),
            sql: command.to_string(),
            done,
        };
        if let Err(e) = self.submit(request) {
            return Reply::Error(e);
        }
        match rx.recv() {
            Ok(reply) => {
                if let Reply::Error(text) = &reply {
                    self.last_error = text.clone();
                }
                reply
            }
            Err(_) => Reply::Error(WORKER_GONE.to_string()),
        }
    }

    fn deallocate(&mut self, name: &str) {
        let (done, rx) = mpsc::sync_channel(1);
        let request = Request::Deallocate {
            name: name.to_string(),
            done,
        };
        if self.submit(request).is_ok() {
            let _ = rx.recv();
        }
    }

    fn send_prepared(&mut self, name: &str, params: &[ParamSlot]) -> Result<(), String> {
        self.start(|replies| Request::Prepared {
            name: name.to_string(),
            params: params.to_vec(),
            replies,
        })
    }

    fn set_single_row_mode(&mut self) -> bool {
        // Rows are always delivered one per reply
        self.replies.is_some()
    }

    fn next_result(&mut self) -> Option<Reply> {
        let replies = self.replies.as_ref()?;
        match replies.recv() {
            Ok(reply) => {
                if let Reply::Error(text) = &reply {
                    self.last_error = text.clone();
                }
                Some(reply)
            }
            Err(_) => {
                self.replies = None;
                None
            }
        }
    }

    fn cancel_or_drain(&mut self) {
        if self.replies.take().is_some() {
            trace!("Discarded pending SQLite replies");
        }
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) {
        self.replies = None;
        self.requests = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("SQLite worker panicked");
            }
        }
    }
}

impl Drop for SqliteTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    conn: Connection,
    /// Prepared statement name -> command text
    prepared: HashMap<String, String>,
}

impl Worker {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            prepared: HashMap::new(),
        }
    }

    fn run(mut self, requests: Receiver<Request>) {
        for request in requests {
            match request {
                Request::Command {
                    sql,
                    params,
                    replies,
                } => self.execute(&sql, &params, &replies),
                Request::Prepare { name, sql, done } => {
                    let _ = done.send(self.prepare(name, sql));
                }
                Request::Prepared {
                    name,
                    params,
                    replies,
                } => match self.prepared.get(&name).cloned() {
                    Some(sql) => self.execute(&sql, &params, &replies),
                    None => {
                        let _ = replies.send(Reply::Error(format!(
                            "prepared statement \"{}\" does not exist",
                            name
                        )));
                    }
                },
                Request::Deallocate { name, done } => {
                    if self.prepared.remove(&name).is_some() {
                        trace!(statement = %name, "Deallocated prepared statement");
                    }
                    let _ = done.send(());
                }
            }
        }
        trace!("SQLite worker stopped");
    }

    fn prepare(&mut self, name: String, sql: String) -> Reply {
        if self.prepared.contains_key(&name) {
            return Reply::Error(format!("prepared statement \"{}\" already exists", name));
        }
        // Compile once so syntax errors surface at prepare time
        if let Err(e) = self.conn.prepare(&sql) {
            return Reply::Error(e.to_string());
        }
        self.prepared.insert(name, sql);
        Reply::CommandOk
    }

    /// Run one statement, handing over each row; stops early once the
    /// receiver is gone.
    fn execute(&self, sql: &str, params: &[ParamSlot], replies: &SyncSender<Reply>) {
        if let Err(text) = self.step_all(sql, params, replies) {
            let _ = replies.send(Reply::Error(text));
        }
    }

    fn step_all(
        &self,
        sql: &str,
        params: &[ParamSlot],
        replies: &SyncSender<Reply>,
    ) -> Result<(), String> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| e.to_string())?;

        let expected = stmt.parameter_count();
        if expected != params.len() {
            return Err(format!(
                "bind message supplies {} parameters, but prepared statement requires {}",
                params.len(),
                expected
            ));
        }
        for (i, param) in params.iter().enumerate() {
            let position = i + 1;
            // `$n` placeholders are named parameters to SQLite
            let index = stmt
                .parameter_index(&format!("${}", position))
                .map_err(|e| e.to_string())?
                .unwrap_or(position);
            stmt.raw_bind_parameter(index, SqliteParam(param))
                .map_err(|e| e.to_string())?;
        }

        let column_count = stmt.column_count();
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.raw_query();
        loop {
            match rows.next().map_err(|e| e.to_string())? {
                Some(row) => {
                    let mut columns = Vec::with_capacity(column_count);
                    let mut values = Vec::with_capacity(column_count);
                    for (i, name) in names.iter().enumerate() {
                        let cell = Cell::from_value_ref(row.get_ref(i).map_err(|e| e.to_string())?);
                        columns.push(Column {
                            name: name.clone(),
                            type_oid: cell.type_oid,
                            format: cell.format,
                        });
                        values.push(cell.data);
                    }
                    let raw = RawRow {
                        columns: Arc::new(columns),
                        values,
                    };
                    if replies.send(Reply::SingleTuple(raw)).is_err() {
                        trace!("Row receiver gone, statement abandoned");
                        return Ok(());
                    }
                }
                None => {
                    let done = if column_count == 0 {
                        Reply::CommandOk
                    } else {
                        Reply::TuplesOk
                    };
                    let _ = replies.send(done);
                    return Ok(());
                }
            }
        }
    }
}
