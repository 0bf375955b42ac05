//! RESP (`REdis` Serialization Protocol) value types

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;
use std::fmt;

/// RESP protocol value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(ErrorReply),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string: $-1\r\n
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// Null array: *-1\r\n
    NullArray,
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) => Ok(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}"))),
            Self::Null | Self::NullArray => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::BulkString(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.clone().into_bytes())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Borrow the elements of an array reply
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array.
    pub fn as_array(&self) -> RedisResult<&[Self]> {
        match self {
            Self::Array(arr) => Ok(arr),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to array"
            ))),
        }
    }

    /// Check if this is a nil bulk string or nil array
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::NullArray)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Check for the `+OK` status
    #[must_use]
    pub fn is_ok_status(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == "OK")
    }

    /// Check for the `+QUEUED` status returned inside MULTI
    #[must_use]
    pub fn is_queued_status(&self) -> bool {
        matches!(self, Self::SimpleString(s) if s == "QUEUED")
    }

    /// Extract the error reply if this is an error
    #[must_use]
    pub fn into_error(self) -> Option<ErrorReply> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

/// An error reply (`-CODE message`)
///
/// The code is the first whitespace-delimited word, e.g. `ERR`, `WRONGTYPE`,
/// `MOVED`. Lines without a message have an empty `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    line: String,
}

impl ErrorReply {
    /// Wrap a raw error line (without the leading `-` and trailing CRLF)
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// Error code, e.g. `ERR`
    #[must_use]
    pub fn code(&self) -> &str {
        self.line.split_whitespace().next().unwrap_or("")
    }

    /// Everything after the code
    #[must_use]
    pub fn message(&self) -> &str {
        self.line
            .split_once(' ')
            .map_or("", |(_, rest)| rest.trim_start())
    }

    /// The full error line
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Classify this error as a cluster redirection
    #[must_use]
    pub fn redirect(&self) -> Option<Redirect> {
        Redirect::parse(&self.line)
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// A cluster redirection extracted from an error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot permanently owned by another node
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host, empty when the server does not know its endpoint
        host: String,
        /// Target port
        port: u16,
    },
    /// Slot being migrated, retry once on the target after `ASKING`
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host, empty when the server does not know its endpoint
        host: String,
        /// Target port
        port: u16,
    },
}

impl Redirect {
    /// Parse `MOVED <slot> <host>:<port>` or `ASK <slot> <host>:<port>`
    ///
    /// The address is split on its last colon so IPv6 literals survive.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let kind = parts.next()?;
        let slot = parts.next()?.parse::<u16>().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        match kind {
            "MOVED" => Some(Self::Moved { slot, host, port }),
            "ASK" => Some(Self::Ask { slot, host, port }),
            _ => None,
        }
    }

    /// Slot named by the redirection
    #[must_use]
    pub const fn slot(&self) -> u16 {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => *slot,
        }
    }

    /// Target host and port
    #[must_use]
    pub fn target(&self) -> (&str, u16) {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => (host.as_str(), *port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_code_and_message() {
        let err = ErrorReply::new("WRONGTYPE Operation against a key holding the wrong kind of value");
        assert_eq!(err.code(), "WRONGTYPE");
        assert_eq!(
            err.message(),
            "Operation against a key holding the wrong kind of value"
        );
        assert!(err.redirect().is_none());

        let bare = ErrorReply::new("ERR");
        assert_eq!(bare.code(), "ERR");
        assert_eq!(bare.message(), "");
    }

    #[test]
    fn test_parse_moved() {
        let redirect = Redirect::parse("MOVED 3999 127.0.0.1:6381").unwrap();
        assert_eq!(
            redirect,
            Redirect::Moved {
                slot: 3999,
                host: "127.0.0.1".to_string(),
                port: 6381
            }
        );
        assert_eq!(redirect.slot(), 3999);
        assert_eq!(redirect.target(), ("127.0.0.1", 6381));
    }

    #[test]
    fn test_parse_ask_ipv6() {
        let redirect = Redirect::parse("ASK 12 ::1:7002").unwrap();
        assert_eq!(redirect.target(), ("::1", 7002));
        assert!(matches!(redirect, Redirect::Ask { slot: 12, .. }));

        let bracketed = Redirect::parse("ASK 12 [fe80::1]:7002").unwrap();
        assert_eq!(bracketed.target(), ("fe80::1", 7002));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Redirect::parse("MOVED").is_none());
        assert!(Redirect::parse("MOVED abc 127.0.0.1:1").is_none());
        assert!(Redirect::parse("MOVED 1 127.0.0.1").is_none());
        assert!(Redirect::parse("MOVED 1 127.0.0.1:1 extra").is_none());
        assert!(Redirect::parse("ERR MOVED 1 127.0.0.1:1").is_none());
    }

    #[test]
    fn test_status_helpers() {
        assert!(RespValue::SimpleString("OK".into()).is_ok_status());
        assert!(RespValue::SimpleString("QUEUED".into()).is_queued_status());
        assert!(RespValue::NullArray.is_null());
        assert_eq!(RespValue::from("12").as_int().unwrap(), 12);
    }
}
