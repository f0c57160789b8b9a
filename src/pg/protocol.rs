//! PostgreSQL v3 wire protocol messages.
//!
//! Only what the wire transport speaks: startup and authentication, the
//! extended query flow with text parameters and text results, statement
//! close, cancellation, and termination.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::params::ParamSlot;
use super::transport::{Column, Format};
use super::types::Oid;

/// Protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608;

/// Code sent in place of the protocol version by a cancel request.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

type ProtocolResult<T> = Result<T, ProtocolError>;

/// Transaction status reported by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Messages the client sends. Each appends its encoding to a buffer so a
/// whole exchange goes out in one write.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage<'a> {
    Startup {
        user: &'a str,
        database: Option<&'a str>,
        options: &'a [(&'a str, &'a str)],
    },
    CancelRequest {
        process_id: i32,
        secret_key: i32,
    },
    /// Cleartext or MD5 password
    Password(&'a str),
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    /// Parse a statement with server-inferred parameter types.
    Parse {
        name: &'a str,
        query: &'a str,
    },
    /// Bind text parameters to the unnamed portal; results come back as text.
    Bind {
        statement: &'a str,
        params: &'a [ParamSlot],
    },
    /// Describe the unnamed portal.
    DescribePortal,
    /// Execute the unnamed portal without a row limit.
    Execute,
    CloseStatement(&'a str),
    Sync,
    Terminate,
}

impl FrontendMessage<'_> {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            FrontendMessage::Startup {
                user,
                database,
                options,
            } => untagged(buf, |body| {
                body.put_i32(PROTOCOL_VERSION);
                put_cstring(body, "user");
                put_cstring(body, user);
                if let Some(db) = database {
                    put_cstring(body, "database");
                    put_cstring(body, db);
                }
                for (key, value) in options.iter() {
                    put_cstring(body, key);
                    put_cstring(body, value);
                }
                body.put_u8(0);
            }),
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => untagged(buf, |body| {
                body.put_i32(CANCEL_REQUEST_CODE);
                body.put_i32(*process_id);
                body.put_i32(*secret_key);
            }),
            FrontendMessage::Password(password) => {
                tagged(buf, b'p', |body| put_cstring(body, password))
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                tagged(buf, b'p', |body| {
                    put_cstring(body, mechanism);
                    body.put_i32(data.len() as i32);
                    body.put_slice(data);
                })
            }
            FrontendMessage::SaslResponse(data) => tagged(buf, b'p', |body| body.put_slice(data)),
            FrontendMessage::Parse { name, query } => tagged(buf, b'P', |body| {
                put_cstring(body, name);
                put_cstring(body, query);
                body.put_i16(0);
            }),
            FrontendMessage::Bind { statement, params } => tagged(buf, b'B', |body| {
                // Unnamed portal
                body.put_u8(0);
                put_cstring(body, statement);
                // No format codes: every parameter is text
                body.put_i16(0);
                body.put_i16(params.len() as i16);
                for param in params.iter() {
                    match param {
                        Some(data) => {
                            body.put_i32(data.len() as i32);
                            body.put_slice(data);
                        }
                        None => body.put_i32(-1),
                    }
                }
                // No result format codes: every column is text
                body.put_i16(0);
            }),
            FrontendMessage::DescribePortal => tagged(buf, b'D', |body| {
                body.put_u8(b'P');
                body.put_u8(0);
            }),
            FrontendMessage::Execute => tagged(buf, b'E', |body| {
                body.put_u8(0);
                body.put_i32(0);
            }),
            FrontendMessage::CloseStatement(name) => tagged(buf, b'C', |body| {
                body.put_u8(b'S');
                put_cstring(body, name);
            }),
            FrontendMessage::Sync => tagged(buf, b'S', |_| {}),
            FrontendMessage::Terminate => tagged(buf, b'X', |_| {}),
        }
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Tag byte, then a length that counts itself but not the tag.
fn tagged(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    untagged(buf, body);
}

fn untagged(buf: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },
    /// An authentication request the client does not implement
    AuthenticationOther { code: i32 },

    RowDescription { columns: Vec<Column> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription,

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { channel: String, payload: String },
}

impl BackendMessage {
    /// Decode one message from its tag and body (the bytes after the length).
    pub fn decode(tag: u8, mut body: Bytes) -> ProtocolResult<Self> {
        match tag {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            }),
            b'Z' => Ok(BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(get_u8(&mut body)?),
            }),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_fields(body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            }),
            b'K' => Ok(BackendMessage::BackendKeyData {
                process_id: get_i32(&mut body)?,
                secret_key: get_i32(&mut body)?,
            }),
            b'A' => {
                get_i32(&mut body)?;
                Ok(BackendMessage::NotificationResponse {
                    channel: read_cstring(&mut body)?,
                    payload: read_cstring(&mut body)?,
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Ok(BackendMessage::ParameterDescription),
            _ => Err(ProtocolError(format!(
                "unknown message type {:?}",
                tag as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> ProtocolResult<Self> {
        match get_i32(&mut body)? {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(ProtocolError("truncated MD5 salt".to_string()));
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mechanism = read_cstring(&mut body)?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            code => Ok(BackendMessage::AuthenticationOther { code }),
        }
    }

    fn decode_row_description(mut body: Bytes) -> ProtocolResult<Self> {
        let count = get_i16(&mut body)?.max(0) as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_cstring(&mut body)?;
            if body.remaining() < 18 {
                return Err(ProtocolError("truncated field description".to_string()));
            }
            // Table OID and attribute number
            body.advance(6);
            let type_oid = Oid(body.get_i32());
            // Type size and modifier
            body.advance(6);
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };
            columns.push(Column {
                name,
                type_oid,
                format,
            });
        }
        Ok(BackendMessage::RowDescription { columns })
    }

    fn decode_data_row(mut body: Bytes) -> ProtocolResult<Self> {
        let count = get_i16(&mut body)?.max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = get_i32(&mut body)?;
            if len < 0 {
                values.push(None);
                continue;
            }
            let len = len as usize;
            if body.remaining() < len {
                return Err(ProtocolError("truncated data row".to_string()));
            }
            values.push(Some(body.split_to(len)));
        }
        Ok(BackendMessage::DataRow { values })
    }
}

fn get_u8(buf: &mut Bytes) -> ProtocolResult<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError("unexpected end of message".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> ProtocolResult<i16> {
    if buf.remaining() < 2 {
        return Err(ProtocolError("unexpected end of message".to_string()));
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> ProtocolResult<i32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError("unexpected end of message".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a NUL-terminated string, replacing invalid UTF-8.
fn read_cstring(buf: &mut Bytes) -> ProtocolResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError("missing string terminator".to_string()))?;
    let s = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(&buf[..end]).into_owned(),
    };
    buf.advance(end + 1);
    Ok(s)
}

/// Error and notice fields, keyed by their one-byte field code.
fn read_fields(mut body: Bytes) -> ProtocolResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.has_remaining() {
        let code = body.get_u8();
        if code == 0 {
            break;
        }
        fields.insert(code, read_cstring(&mut body)?);
    }
    Ok(fields)
}

/// Render error fields the way libpq prints a result error:
/// `SEVERITY:  message`, then DETAIL and HINT lines when present.
pub fn error_text(fields: &HashMap<u8, String>) -> String {
    let severity = fields
        .get(&b'V')
        .or_else(|| fields.get(&b'S'))
        .map(String::as_str)
        .unwrap_or("ERROR");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or("");
    let mut text = format!("{}:  {}\n", severity, message);
    if let Some(detail) = fields.get(&b'D') {
        text.push_str(&format!("DETAIL:  {}\n", detail));
    }
    if let Some(hint) = fields.get(&b'H') {
        text.push_str(&format!("HINT:  {}\n", hint));
    }
    text
}
