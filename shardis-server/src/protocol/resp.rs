//! RESP2 wire protocol
//!
//! Replies and command lines share one representation: a command line is an
//! array of bulk strings. Inline commands (`PING\r\n`) are accepted for
//! interactive use.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// A single command line: command name followed by its arguments
pub type CmdLine = Vec<Bytes>;

/// Maximum accepted bulk string length (512MB, same as Redis)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum accepted array length
const MAX_ARRAY_LEN: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Protocol error: invalid type byte '{0}'")]
    InvalidType(char),
    #[error("Protocol error: invalid length")]
    InvalidLength,
    #[error("Protocol error: invalid integer")]
    InvalidInteger,
    #[error("Protocol error: expected CRLF")]
    MissingCrlf,
    #[error("Protocol error: invalid utf-8")]
    InvalidUtf8,
}

/// RESP2 value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// Error reply; `msg` carries its own code prefix (`ERR`, `NOTLEADER`, ...)
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s == "OK")
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Encode a command line as an array of bulk strings
    pub fn from_cmdline(cmdline: &CmdLine) -> Self {
        Reply::Array(cmdline.iter().cloned().map(Reply::Bulk).collect())
    }

    /// Interpret an array of bulk strings as a command line
    pub fn into_cmdline(self) -> Option<CmdLine> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(b) => Some(b),
                    Reply::Status(s) => Some(Bytes::from(s)),
                    Reply::Integer(n) => Some(Bytes::from(n.to_string())),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Serialize into RESP2 bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Null => buf.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Reply::Null => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

/// Build a command line from anything byte-like
pub fn to_cmdline<I, T>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Incremental RESP parser over a growable buffer
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    /// Parse one complete value from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from the buffer only when a full value was decoded.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let parsed = if is_type_byte(buf[0]) {
            parse_value(&buf[..])?
        } else {
            parse_inline(&buf[..])?
        };
        match parsed {
            Some((reply, consumed)) => {
                buf.advance(consumed);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

fn is_type_byte(b: u8) -> bool {
    matches!(b, b'+' | b'-' | b':' | b'$' | b'*')
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn read_line(data: &[u8]) -> Result<Option<(&str, usize)>, ProtocolError> {
    match find_crlf(data) {
        Some(pos) => {
            let line = std::str::from_utf8(&data[..pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Some((line, pos + 2)))
        }
        None => Ok(None),
    }
}

fn parse_int(line: &str) -> Result<i64, ProtocolError> {
    line.parse::<i64>().map_err(|_| ProtocolError::InvalidInteger)
}

fn parse_value(data: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    let Some((line, header_len)) = read_line(&data[1..])? else {
        return Ok(None);
    };
    let header_len = header_len + 1;

    match data[0] {
        b'+' => Ok(Some((Reply::Status(line.to_string()), header_len))),
        b'-' => Ok(Some((Reply::Error(line.to_string()), header_len))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Null, header_len)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::InvalidLength);
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }
            let payload = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((Reply::Bulk(payload), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Null, header_len)));
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(ProtocolError::InvalidLength);
            }
            let mut items = Vec::with_capacity(len);
            let mut offset = header_len;
            for _ in 0..len {
                if offset >= data.len() {
                    return Ok(None);
                }
                match parse_value(&data[offset..])? {
                    Some((item, used)) => {
                        items.push(item);
                        offset += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), offset)))
        }
        other => Err(ProtocolError::InvalidType(other as char)),
    }
}

fn parse_inline(data: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    let Some(pos) = data.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line = &data[..pos];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
    let parts = text
        .split_whitespace()
        .map(|s| Reply::Bulk(Bytes::copy_from_slice(s.as_bytes())))
        .collect();
    Ok(Some((Reply::Array(parts), pos + 1)))
}
