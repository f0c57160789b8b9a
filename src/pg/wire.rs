//! PostgreSQL wire transport.
//!
//! A blocking TCP client for the v3 protocol. Every command is one extended
//! query exchange (Parse, Bind, Describe, Execute, Sync) and replies are read
//! off the socket one message at a time, so a `next_result` call never holds
//! more than one row.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::auth::{md5_password, ScramClient, SCRAM_SHA_256};
use super::config::ConnectionConfig;
use super::params::ParamSlot;
use super::protocol::{error_text, BackendMessage, FrontendMessage, ProtocolError};
use super::transport::{Connector, RawRow, Reply, SharedColumns, Transport};

const DEFAULT_USER: &str = "postgres";
const APPLICATION_NAME: &str = "pgkit";

/// Upper bound on a single backend message.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// How long a cancel request may take to deliver.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WireError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// A rendered `ErrorResponse`
    #[error("{0}")]
    Server(String),

    #[error("server closed the connection unexpectedly")]
    Closed,

    #[error("connection is closed")]
    NotOpen,
}

// ============================================================================
// Connector
// ============================================================================

/// Opens wire transports.
///
/// Recognized parameters: `host`, `port`, `dbname`, `user` (default
/// `postgres`), `password`, `connect_timeout` in seconds (bounds the TCP
/// connect and the startup handshake), and `options`, which is passed to the
/// server as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn Transport>, String> {
        let config =
            ConnectionConfig::from_conninfo(conninfo).map_err(|e| e.message().to_string())?;
        WireTransport::connect(&config)
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .map_err(|e| e.to_string())
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct WireTransport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
    /// Backend process id and secret key, for cancel requests
    backend_key: Option<(i32, i32)>,
    /// A Sync was sent and its ReadyForQuery is still unread
    in_flight: bool,
    /// The current command's terminal reply was delivered
    finished: bool,
    columns: Option<SharedColumns>,
    last_error: String,
    closed: bool,
}

impl WireTransport {
    /// Connect, then run the startup handshake and authentication.
    pub fn connect(config: &ConnectionConfig) -> Result<Self, WireError> {
        if config.host.starts_with('/') {
            return Err(WireError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "Unix-domain sockets are not supported",
            )));
        }
        let timeout = config
            .connect_timeout
            .filter(|&secs| secs > 0)
            .map(|secs| Duration::from_secs(secs.into()));

        let stream = open_stream(&config.host, config.port, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(timeout)?;
        let peer = stream.peer_addr()?;

        let mut transport = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            peer,
            backend_key: None,
            in_flight: false,
            finished: true,
            columns: None,
            last_error: String::new(),
            closed: false,
        };
        transport.startup(config)?;
        transport.writer.get_ref().set_read_timeout(None)?;

        info!(host = %config.host, port = config.port, "PostgreSQL session started");
        Ok(transport)
    }

    fn startup(&mut self, config: &ConnectionConfig) -> Result<(), WireError> {
        let user = config.user.as_deref().unwrap_or(DEFAULT_USER);
        let mut options = vec![
            ("application_name", APPLICATION_NAME),
            ("client_encoding", "UTF8"),
        ];
        if let Some(extra) = config.options.as_deref() {
            options.push(("options", extra));
        }
        self.send(&[FrontendMessage::Startup {
            user,
            database: config.database.as_deref(),
            options: &options,
        }])?;

        let password = || {
            config
                .password
                .as_deref()
                .ok_or_else(|| WireError::Auth("the server requested a password".to_string()))
        };

        loop {
            match self.receive()? {
                BackendMessage::AuthenticationOk => trace!("Authenticated"),
                BackendMessage::AuthenticationCleartextPassword => {
                    self.send(&[FrontendMessage::Password(password()?)])?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(user, password()?, &salt);
                    self.send(&[FrontendMessage::Password(&hash)])?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(WireError::Auth(format!(
                            "unsupported SASL mechanisms: {}",
                            mechanisms.join(", ")
                        )));
                    }
                    self.authenticate_scram(user, password()?)?;
                }
                BackendMessage::AuthenticationOther { code } => {
                    return Err(WireError::Auth(format!(
                        "unsupported authentication request {}",
                        code
                    )));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => self.backend_key = Some((process_id, secret_key)),
                BackendMessage::ReadyForQuery { .. } => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(WireError::Server(error_text(&fields)));
                }
                other => observe(other),
            }
        }
    }

    fn authenticate_scram(&mut self, user: &str, password: &str) -> Result<(), WireError> {
        let mut scram = ScramClient::new(user, password);
        let client_first = scram.client_first_message();
        self.send(&[FrontendMessage::SaslInitialResponse {
            mechanism: SCRAM_SHA_256,
            data: &client_first,
        }])?;

        loop {
            match self.receive()? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| WireError::Auth(e.to_string()))?;
                    self.send(&[FrontendMessage::SaslResponse(&client_final)])?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| WireError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(WireError::Server(error_text(&fields)));
                }
                other => observe(other),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------------

    fn send(&mut self, messages: &[FrontendMessage<'_>]) -> Result<(), WireError> {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode(&mut buf);
        }
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<BackendMessage, WireError> {
        let mut header = [0u8; 5];
        read_full(&mut self.reader, &mut header)?;
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(ProtocolError(format!("invalid message length {}", len)).into());
        }
        let mut body = vec![0u8; len as usize - 4];
        read_full(&mut self.reader, &mut body)?;
        Ok(BackendMessage::decode(header[0], Bytes::from(body))?)
    }

    // ------------------------------------------------------------------------
    // Exchanges
    // ------------------------------------------------------------------------

    /// Start an exchange: finish the previous one, then send `messages`.
    fn submit(&mut self, messages: &[FrontendMessage<'_>]) -> Result<(), String> {
        self.drain();
        if self.closed {
            self.last_error = WireError::NotOpen.to_string();
            return Err(self.last_error.clone());
        }
        self.columns = None;
        self.finished = false;
        self.last_error.clear();

        match self.send(messages) {
            Ok(()) => {
                self.in_flight = true;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Wait out an exchange that returns no rows.
    fn finish(&mut self) -> Reply {
        self.drain();
        self.finished = true;
        if self.last_error.is_empty() {
            Reply::CommandOk
        } else {
            Reply::Error(self.last_error.clone())
        }
    }

    /// Read and discard everything up to the ReadyForQuery that ends the
    /// current exchange.
    fn drain(&mut self) {
        while self.in_flight {
            match self.receive() {
                Ok(BackendMessage::ReadyForQuery { status }) => {
                    trace!(?status, "Ready for query");
                    self.in_flight = false;
                }
                Ok(BackendMessage::ErrorResponse { fields }) => {
                    self.last_error = error_text(&fields);
                }
                Ok(other) => observe(other),
                Err(e) => {
                    self.fail(e);
                }
            }
        }
    }

    /// Ask the server to stop the running command. Returns once the server
    /// has taken the request.
    fn cancel(&self) {
        let Some((process_id, secret_key)) = self.backend_key else {
            return;
        };
        let mut buf = BytesMut::new();
        FrontendMessage::CancelRequest {
            process_id,
            secret_key,
        }
        .encode(&mut buf);

        let sent = TcpStream::connect_timeout(&self.peer, CANCEL_TIMEOUT).and_then(|mut stream| {
            stream.set_read_timeout(Some(CANCEL_TIMEOUT))?;
            stream.write_all(&buf)?;
            // The server closes the socket once the request is handled
            let _ = stream.read(&mut [0u8; 1]);
            Ok(())
        });
        match sent {
            Ok(()) => debug!(process_id, "Sent cancel request"),
            Err(e) => debug!(error = %e, "Cancel request failed"),
        }
    }

    /// Record a fatal error. The socket is shut down.
    fn fail(&mut self, error: WireError) -> String {
        let text = error.to_string();
        warn!(error = %text, "PostgreSQL connection lost");
        self.last_error = text.clone();
        self.in_flight = false;
        self.finished = true;
        self.closed = true;
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        text
    }
}

impl Transport for WireTransport {
    fn send_command(&mut self, command: &str, params: &[ParamSlot]) -> Result<(), String> {
        self.submit(&[
            FrontendMessage::Parse {
                name: "",
                query: command,
            },
            FrontendMessage::Bind {
                statement: "",
                params,
            },
            FrontendMessage::DescribePortal,
            FrontendMessage::Execute,
            FrontendMessage::Sync,
        ])
    }

    fn prepare(&mut self, name: &str, command: &str) -> Reply {
        let parse = FrontendMessage::Parse {
            name,
            query: command,
        };
        match self.submit(&[parse, FrontendMessage::Sync]) {
            Ok(()) => self.finish(),
            Err(text) => Reply::Error(text),
        }
    }

    fn deallocate(&mut self, name: &str) {
        if self
            .submit(&[FrontendMessage::CloseStatement(name), FrontendMessage::Sync])
            .is_ok()
        {
            if let Reply::Error(text) = self.finish() {
                debug!(statement = name, error = %text, "Deallocate failed");
            }
        }
    }

    fn send_prepared(&mut self, name: &str, params: &[ParamSlot]) -> Result<(), String> {
        self.submit(&[
            FrontendMessage::Bind {
                statement: name,
                params,
            },
            FrontendMessage::DescribePortal,
            FrontendMessage::Execute,
            FrontendMessage::Sync,
        ])
    }

    fn set_single_row_mode(&mut self) -> bool {
        // Rows are always read one message at a time
        self.in_flight
    }

    fn next_result(&mut self) -> Option<Reply> {
        if !self.in_flight {
            return None;
        }
        if self.finished {
            self.drain();
            return None;
        }

        loop {
            let message = match self.receive() {
                Ok(message) => message,
                Err(e) => {
                    self.fail(e);
                    return None;
                }
            };
            match message {
                BackendMessage::RowDescription { columns } => {
                    self.columns = Some(Arc::new(columns));
                }
                BackendMessage::DataRow { values } => {
                    let columns = self.columns.clone().unwrap_or_default();
                    return Some(Reply::SingleTuple(RawRow { columns, values }));
                }
                BackendMessage::CommandComplete { tag } => {
                    trace!(%tag, "Command complete");
                    self.finished = true;
                    return Some(if self.columns.is_some() {
                        Reply::TuplesOk
                    } else {
                        Reply::CommandOk
                    });
                }
                BackendMessage::EmptyQueryResponse => {
                    self.finished = true;
                    return Some(Reply::CommandOk);
                }
                BackendMessage::ErrorResponse { fields } => {
                    let text = error_text(&fields);
                    self.last_error = text.clone();
                    self.finished = true;
                    return Some(Reply::Error(text));
                }
                BackendMessage::ReadyForQuery { .. } => {
                    self.in_flight = false;
                    return None;
                }
                other => observe(other),
            }
        }
    }

    fn cancel_or_drain(&mut self) {
        if self.in_flight && !self.finished && self.columns.is_some() {
            self.cancel();
        }
        self.drain();
        self.columns = None;
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.in_flight = false;
        if self.send(&[FrontendMessage::Terminate]).is_err() {
            debug!("Terminate was not delivered");
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        debug!("PostgreSQL session closed");
    }
}

impl Drop for WireTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Log asynchronous server messages and ignore protocol acknowledgements.
fn observe(message: BackendMessage) {
    match message {
        BackendMessage::NoticeResponse { fields } => {
            debug!(notice = %error_text(&fields).trim_end(), "Server notice");
        }
        BackendMessage::NotificationResponse { channel, payload } => {
            debug!(%channel, %payload, "Notification ignored");
        }
        BackendMessage::ParameterStatus { name, value } => {
            trace!(%name, %value, "Server parameter");
        }
        _ => {}
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => WireError::Closed,
        _ => WireError::Io(e),
    })
}

fn open_stream(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, WireError> {
    let Some(timeout) = timeout else {
        return Ok(TcpStream::connect((host, port))?);
    };
    let mut last = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(WireError::Io(last.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not translate host name \"{}\" to address", host),
        )
    })))
}
