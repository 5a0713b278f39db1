use bytes::{Buf, BytesMut};

/// A command line as it travels between the codec, the command table, the
/// append-only log and peer nodes: name first, then the raw arguments.
pub type CmdLine = Vec<Vec<u8>>;

/// A RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n  or  $-1\r\n (null)
    BulkString(Option<Vec<u8>>),
    /// *2\r\n...  or  *-1\r\n (null)
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Vec<u8>>) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    pub fn null_bulk_string() -> Self {
        RespValue::BulkString(None)
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    /// Encode a command line as an array of bulk strings, the framing used
    /// both on the wire to peers and in the append-only file.
    pub fn from_cmdline(cmdline: &[Vec<u8>]) -> Self {
        RespValue::Array(Some(
            cmdline
                .iter()
                .map(|arg| RespValue::BulkString(Some(arg.clone())))
                .collect(),
        ))
    }

    /// Interpret a request as a command line. Returns `None` unless this is a
    /// non-empty array whose items are all strings.
    pub fn into_cmdline(self) -> Option<CmdLine> {
        match self {
            RespValue::Array(Some(items)) if !items.is_empty() => items
                .into_iter()
                .map(|item| match item {
                    RespValue::BulkString(Some(data)) => Some(data),
                    RespValue::SimpleString(s) => Some(s.into_bytes()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Serialize this value to RESP bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Write RESP bytes into the given buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, b'+', s.as_bytes()),
            RespValue::Error(s) => write_line(buf, b'-', s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, b':', n.to_string().as_bytes()),
            RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::BulkString(Some(data)) => {
                write_line(buf, b'$', data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                write_line(buf, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }
}

fn write_line(buf: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    buf.push(prefix);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: usize = 1024 * 1024;
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Streaming RESP parser.
///
/// `parse` consumes exactly one complete value from the front of the buffer,
/// or leaves the buffer untouched and returns `Ok(None)` when the value is
/// still incomplete.
pub struct RespParser;

impl RespParser {
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let parsed = match buf[0] {
            b'+' | b'-' | b':' | b'$' | b'*' => parse_value(buf, 0)?,
            _ => parse_inline(buf)?,
        };
        Ok(parsed.map(|(value, consumed)| {
            buf.advance(consumed);
            value
        }))
    }

    /// Like [`RespParser::parse`] but rejects inline commands. Used where the
    /// input is machine-written (log files, peer replies).
    pub fn parse_strict(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }
        match parse_value(buf, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// Parse one value starting at `pos`. Returns the value and the position just
/// past it.
fn parse_value(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..end];
    let next = end + 2;
    match buf[pos] {
        b'+' => Ok(Some((RespValue::SimpleString(lossy(line)), next))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), next))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::BulkString(None), next)));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|n| *n <= MAX_BULK_LEN)
                .ok_or_else(|| RespError::InvalidData("invalid bulk length".into()))?;
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(RespError::InvalidData(
                    "missing trailing CRLF after bulk string".into(),
                ));
            }
            let data = buf[next..next + len].to_vec();
            Ok(Some((RespValue::BulkString(Some(data)), next + len + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|n| *n <= MAX_ARRAY_LEN)
                .ok_or_else(|| RespError::InvalidData("invalid multibulk length".into()))?;
            let mut items = Vec::with_capacity(len.min(64));
            let mut cursor = next;
            for _ in 0..len {
                if cursor >= buf.len() {
                    return Ok(None);
                }
                match parse_value(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(RespError::InvalidByte(other)),
    }
}

/// Plain-text command terminated by CRLF, split on whitespace.
fn parse_inline(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(end) = find_crlf(buf, 0) else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(RespError::InvalidData("inline command too long".into()));
        }
        return Ok(None);
    };
    let items = buf[..end]
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| RespValue::BulkString(Some(part.to_vec())))
        .collect();
    Ok(Some((RespValue::Array(Some(items)), end + 2)))
}

fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < start + 2 {
        return None;
    }
    buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|offset| start + offset)
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespError::InvalidData(format!("invalid integer: {}", lossy(line))))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("unexpected type byte '{}'", *.0 as char)]
    InvalidByte(u8),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
