//! Backend (server to client) message framing and decoding.

use crate::error::{Error, Result};
use crate::pubsub::Notification;
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;

// Postgres never allocates more than 1GiB for a single value, so no sane
// server sends a larger frame.
const MAX_FRAME_SIZE: usize = 1 << 30;

/// Frame header: 1 byte message code plus a u32 length that includes itself.
const HEADER_LEN: usize = 5;

/// Postgres backend messages are framed by a 1 byte message code,
/// followed by a u32 integer delineating the length of the rest of
/// the message.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NEGOTIATE_PROTOCOL_VERSION: Self = Self(b'v');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_IN_RESPONSE => "CopyInResponse",
            MessageCode::COPY_OUT_RESPONSE => "CopyOutResponse",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NEGOTIATE_PROTOCOL_VERSION => "NegotiateProtocolVersion",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub code: MessageCode,
    pub body: Bytes,
}

impl Frame {
    pub fn new(code: impl Into<MessageCode>, body: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }
}

/// Incremental backend frame parser
///
/// Bytes read off the socket are fed in as they arrive; complete frames are
/// split off the front of the buffer.
pub struct FrameParser {
    buffer: BytesMut,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Feed data into the parser
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a complete frame is waiting in the buffer
    pub fn has_frame(&self) -> bool {
        match self.frame_len() {
            Ok(Some(len)) => self.buffer.len() >= len,
            // Let parse_next report the error
            Err(_) => true,
            Ok(None) => false,
        }
    }

    /// Parse next complete frame, `None` if more data is needed
    pub fn parse_next(&mut self) -> Result<Option<Frame>> {
        let Some(total) = self.frame_len()? else {
            return Ok(None);
        };
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        let code = MessageCode::from(frame[0]);
        frame.advance(HEADER_LEN);
        Ok(Some(Frame::new(code, frame.freeze())))
    }

    fn frame_len(&self) -> Result<Option<usize>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if len < 4 {
            return Err(Error::protocol(format!("invalid frame length {len}")));
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "frame size {len} exceeds {MAX_FRAME_SIZE}B"
            )));
        }
        Ok(Some(len + 1))
    }
}

fn need(body: &Bytes, n: usize, what: &str) -> Result<()> {
    if body.remaining() < n {
        return Err(Error::protocol(format!("truncated {what}")));
    }
    Ok(())
}

pub fn read_cstring(body: &mut Bytes) -> Result<String> {
    let Some(end) = memchr(0, &body[..]) else {
        return Err(Error::protocol("null terminator missing"));
    };
    let bytes = body.split_to(end + 1);
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|e| Error::protocol(format!("invalid UTF-8 in string: {e}")))
}

/// A decoded ErrorResponse or NoticeResponse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: Option<String>, // S
    pub code: Option<String>,     // C
    pub message: Option<String>,  // M
    pub detail: Option<String>,   // D
    pub hint: Option<String>,     // H
    pub position: Option<String>, // P
    pub r#where: Option<String>,  // W
    pub routine: Option<String>,  // R
}

impl ServerError {
    pub fn parse(body: &Bytes) -> Self {
        let mut resp = ServerError::default();

        for field in body[..].split(|b| *b == 0) {
            if field.is_empty() {
                break;
            }
            let value = String::from_utf8_lossy(&field[1..]).into_owned();
            match field[0] {
                b'S' => resp.severity = Some(value),
                b'C' => resp.code = Some(value),
                b'M' => resp.message = Some(value),
                b'D' => resp.detail = Some(value),
                b'H' => resp.hint = Some(value),
                b'P' => resp.position = Some(value),
                b'W' => resp.r#where = Some(value),
                b'R' => resp.routine = Some(value),
                _ => {}
            }
        }

        resp
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = self.severity.as_deref().unwrap_or("UNKNOWN");
        let code = self.code.as_deref().unwrap_or("?????");
        let msg = self.message.as_deref().unwrap_or("<no message>");
        write!(f, "[{sev}] {code}: {msg}")
    }
}

impl std::error::Error for ServerError {}

pub fn decode_notification(mut body: Bytes) -> Result<Notification> {
    need(&body, 4, "NotificationResponse")?;
    let process_id = body.get_i32();
    let channel = read_cstring(&mut body)?;
    let payload = read_cstring(&mut body)?;
    Ok(Notification::new(process_id, channel, payload))
}

pub fn decode_parameter_status(mut body: Bytes) -> Result<(String, String)> {
    let key = read_cstring(&mut body)?;
    let val = read_cstring(&mut body)?;
    Ok((key, val))
}

pub fn decode_backend_key_data(mut body: Bytes) -> Result<(i32, i32)> {
    need(&body, 8, "BackendKeyData")?;
    Ok((body.get_i32(), body.get_i32()))
}

pub fn decode_row_description(mut body: Bytes) -> Result<Vec<String>> {
    need(&body, 2, "RowDescription")?;
    let count = body.get_i16();
    if count < 0 {
        return Err(Error::protocol(format!("negative field count {count}")));
    }

    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_cstring(&mut body)?;
        // table oid, attnum, type oid, typlen, typmod, format code
        need(&body, 18, "RowDescription field")?;
        body.advance(18);
        columns.push(name);
    }
    Ok(columns)
}

pub fn decode_data_row(mut body: Bytes) -> Result<Vec<Option<String>>> {
    need(&body, 2, "DataRow")?;
    let count = body.get_i16();
    if count < 0 {
        return Err(Error::protocol(format!("negative value count {count}")));
    }

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        need(&body, 4, "DataRow value")?;
        let len = body.get_i32();
        if len == -1 {
            values.push(None);
            continue;
        }
        if len < 0 {
            return Err(Error::protocol(format!("negative column length {len}")));
        }
        let len = len as usize;
        need(&body, len, "DataRow value")?;
        let raw = body.split_to(len);
        values.push(Some(String::from_utf8_lossy(&raw).into_owned()));
    }
    Ok(values)
}

pub fn decode_command_complete(mut body: Bytes) -> Result<String> {
    read_cstring(&mut body)
}

/// Rows affected according to a CommandComplete tag (`INSERT 0 3`, `UPDATE 2`)
pub fn rows_affected(tag: &str) -> u64 {
    let mut parts = tag.split_whitespace();
    match parts.next() {
        Some("INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE") => {
            parts.last().and_then(|n| n.parse().ok()).unwrap_or(0)
        }
        _ => 0,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password,
    Sasl(Vec<String>),
    SaslContinue(String),
    SaslFinal(String),
    Other(u32),
}

pub fn decode_authentication(mut body: Bytes) -> Result<AuthRequest> {
    need(&body, 4, "Authentication")?;
    let req = match body.get_u32() {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => AuthRequest::Md5Password,
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let mech = read_cstring(&mut body)?;
                if mech.is_empty() {
                    break;
                }
                mechanisms.push(mech);
            }
            AuthRequest::Sasl(mechanisms)
        }
        11 => AuthRequest::SaslContinue(String::from_utf8_lossy(&body).into_owned()),
        12 => AuthRequest::SaslFinal(String::from_utf8_lossy(&body).into_owned()),
        code => AuthRequest::Other(code),
    };
    Ok(req)
}
