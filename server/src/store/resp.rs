//! RESP2 framing used to talk to a Redis-compatible store.

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string.
    BulkString(Option<Vec<u8>>),
    /// `None` is the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    /// Turns an error reply into `StoreError::Redis`.
    pub fn into_result(self) -> Result<RespValue, StoreError> {
        match self {
            RespValue::Error(message) => Err(StoreError::Redis(message)),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_bytes(self) -> Result<Option<Vec<u8>>, StoreError> {
        match self.into_result()? {
            RespValue::BulkString(bytes) => Ok(bytes),
            RespValue::SimpleString(text) => Ok(Some(text.into_bytes())),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<RespValue>, StoreError> {
        match self.into_result()? {
            RespValue::Array(items) => Ok(items.unwrap_or_default()),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn expect_ok(self) -> Result<(), StoreError> {
        match self.into_result()? {
            RespValue::SimpleString(_) => Ok(()),
            other => Err(unexpected("status reply", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &RespValue) -> StoreError {
    StoreError::Protocol(format!("expected {}, got {:?}", wanted, got))
}

/// Encodes one command as an array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut Vec<u8>) {
    buf.push(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        buf.push(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Largest bulk string accepted, matching the server's own default limit.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Longest type line accepted before a CRLF shows up.
const MAX_LINE_LEN: usize = 64 * 1024;

const MAX_DEPTH: usize = 16;

/// Outcome of parsing the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A value and the number of bytes it occupied.
    Complete(RespValue, usize),
    /// Parsing cannot succeed before the buffer holds at least this many bytes.
    Incomplete(usize),
}

/// Parses one value from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete value,
/// otherwise the value together with the number of bytes it occupied.
pub fn parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, StoreError> {
    match parse_frame(buf)? {
        Parsed::Complete(value, used) => Ok(Some((value, used))),
        Parsed::Incomplete(_) => Ok(None),
    }
}

/// Like [`parse`], but says how much input an incomplete value needs at least.
///
/// Lengths announced by the server are checked against the buffer and
/// against fixed limits before anything is allocated.
pub fn parse_frame(buf: &[u8]) -> Result<Parsed, StoreError> {
    parse_at(buf, 0)
}

fn parse_at(buf: &[u8], depth: usize) -> Result<Parsed, StoreError> {
    let Some(line_end) = find_crlf(buf) else {
        if buf.len() > MAX_LINE_LEN {
            return Err(StoreError::Protocol(format!(
                "no line end within {} bytes",
                MAX_LINE_LEN
            )));
        }
        return Ok(Parsed::Incomplete(buf.len() + 1));
    };
    if line_end == 0 {
        return Err(StoreError::Protocol("empty reply line".to_string()));
    }

    let line = &buf[1..line_end];
    let after = line_end + 2;

    match buf[0] {
        b'+' => Ok(Parsed::Complete(RespValue::SimpleString(text(line)), after)),
        b'-' => Ok(Parsed::Complete(RespValue::Error(text(line)), after)),
        b':' => Ok(Parsed::Complete(RespValue::Integer(integer(line)?), after)),
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(Parsed::Complete(RespValue::BulkString(None), after));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= MAX_BULK_LEN)
                .ok_or_else(|| {
                    StoreError::Protocol(format!("bulk string of {} bytes is too large", len))
                })?;
            let end = after + len;
            if buf.len() < end + 2 {
                return Ok(Parsed::Incomplete(end + 2));
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(StoreError::Protocol("bulk string not terminated".to_string()));
            }
            Ok(Parsed::Complete(
                RespValue::BulkString(Some(buf[after..end].to_vec())),
                end + 2,
            ))
        }
        b'*' => {
            if depth >= MAX_DEPTH {
                return Err(StoreError::Protocol("reply nested too deeply".to_string()));
            }
            let count = integer(line)?;
            if count < 0 {
                return Ok(Parsed::Complete(RespValue::Array(None), after));
            }
            let count = usize::try_from(count)
                .map_err(|_| StoreError::Protocol(format!("array of {} items", count)))?;

            // Every item takes at least three bytes, so the buffer bounds the
            // allocation whatever count the server claims.
            let mut items = Vec::with_capacity(count.min((buf.len() - after) / 3));
            let mut pos = after;
            for _ in 0..count {
                match parse_at(&buf[pos..], depth + 1)? {
                    Parsed::Complete(item, used) => {
                        items.push(item);
                        pos += used;
                    }
                    Parsed::Incomplete(needed) => return Ok(Parsed::Incomplete(pos + needed)),
                }
            }
            Ok(Parsed::Complete(RespValue::Array(Some(items)), pos))
        }
        other => Err(StoreError::Protocol(format!(
            "unexpected reply type byte {:#04x}",
            other
        ))),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn integer(line: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| StoreError::Protocol(format!("invalid integer {:?}", text(line))))
}
