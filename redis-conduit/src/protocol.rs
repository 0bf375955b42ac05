//! RESP2 protocol implementation
//!
//! This module implements the Redis Serialization Protocol (RESP2) for
//! encoding commands and decoding replies. Decoding is incremental: the
//! decoder works on whatever has been buffered so far and reports
//! `Ok(None)` when it needs more bytes; the caller retries from the start of
//! the buffer once more data has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis_conduit_core::{
    error::{RedisError, RedisResult},
    value::{ErrorReply, RespValue},
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Largest bulk string the server will ever send (proto-max-bulk-len)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Encodes commands and RESP values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value into a buffer
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_str().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => Self::put_bulk(data, buf),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::NullArray => buf.put_slice(b"*-1\r\n"),
            RespValue::Array(arr) => {
                Self::put_len(b'*', arr.len(), buf);
                for item in arr {
                    Self::encode(item, buf);
                }
            }
        }
    }

    /// Encode a command: an array of bulk strings, identifier first, arguments in order
    pub fn encode_command(name: &str, args: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            16 + name.len() + args.iter().map(|a| a.len() + 16).sum::<usize>(),
        );
        Self::encode_command_into(name, args, &mut buf);
        buf.freeze()
    }

    /// Append an encoded command to an existing buffer
    pub fn encode_command_into(name: &str, args: &[Bytes], buf: &mut BytesMut) {
        Self::put_len(b'*', 1 + args.len(), buf);
        Self::put_bulk(name.as_bytes(), buf);
        for arg in args {
            Self::put_bulk(arg, buf);
        }
    }

    fn put_len(prefix: u8, len: usize, buf: &mut BytesMut) {
        buf.put_u8(prefix);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }

    fn put_bulk(data: &[u8], buf: &mut BytesMut) {
        Self::put_len(b'$', data.len(), buf);
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// The head of a reply, as seen by a streaming reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHead {
    /// An array of this many elements follows
    Array(usize),
    /// Any other reply, fully decoded (including nil arrays)
    Complete(RespValue),
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode a RESP value from a buffer
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete reply.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];

        match type_byte {
            b'+' => Self::decode_simple_string(buf),
            b'-' => Self::decode_error(buf),
            b':' => Self::decode_integer(buf),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf),
            _ => Err(RedisError::protocol(format!(
                "Invalid RESP type byte: {:?}",
                type_byte as char
            ))),
        }
    }

    /// Decode the head of a reply without materializing array elements
    pub fn decode_head(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<ReplyHead>> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        if buf.chunk()[0] != b'*' {
            return Ok(Self::decode(buf)?.map(ReplyHead::Complete));
        }

        buf.advance(1);
        Ok(Self::read_length(buf, "array")?.map(|len| match len {
            None => ReplyHead::Complete(RespValue::NullArray),
            Some(len) => ReplyHead::Array(len),
        }))
    }

    fn decode_simple_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);
        Ok(Self::read_text_line(buf)?.map(RespValue::SimpleString))
    }

    fn decode_error(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);
        Ok(Self::read_text_line(buf)?.map(|line| RespValue::Error(ErrorReply::new(line))))
    }

    fn decode_integer(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);
        match Self::read_text_line(buf)? {
            Some(line) => line
                .parse::<i64>()
                .map(|num| Some(RespValue::Integer(num)))
                .map_err(|e| RedisError::protocol(format!("Invalid integer {line:?}: {e}"))),
            None => Ok(None),
        }
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);

        let len = match Self::read_length(buf, "bulk string")? {
            Some(Some(len)) => len,
            Some(None) => return Ok(Some(RespValue::Null)),
            None => return Ok(None),
        };

        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len);

        if &buf.chunk()[..2] != CRLF {
            return Err(RedisError::protocol(
                "Bulk string not terminated by CRLF",
            ));
        }
        buf.advance(2);

        Ok(Some(RespValue::BulkString(data)))
    }

    fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);

        let len = match Self::read_length(buf, "array")? {
            Some(Some(len)) => len,
            Some(None) => return Ok(Some(RespValue::NullArray)),
            None => return Ok(None),
        };

        let mut arr = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            match Self::decode(buf)? {
                Some(value) => arr.push(value),
                None => return Ok(None),
            }
        }

        Ok(Some(RespValue::Array(arr)))
    }

    /// Read a length prefix: `Some(None)` for `-1`, `None` when incomplete
    fn read_length(buf: &mut Cursor<&[u8]>, what: &str) -> RedisResult<Option<Option<usize>>> {
        let line = match Self::read_text_line(buf)? {
            Some(line) => line,
            None => return Ok(None),
        };

        let len = line
            .parse::<i64>()
            .map_err(|e| RedisError::protocol(format!("Invalid {what} length {line:?}: {e}")))?;

        match len {
            -1 => Ok(Some(None)),
            len if len < 0 || len > MAX_BULK_LEN => Err(RedisError::protocol(format!(
                "Invalid {what} length: {len}"
            ))),
            len => Ok(Some(Some(len as usize))),
        }
    }

    fn read_text_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<String>> {
        match Self::read_line(buf) {
            Some(line) => String::from_utf8(line.to_vec())
                .map(Some)
                .map_err(|e| RedisError::protocol(format!("Invalid UTF-8: {e}"))),
            None => Ok(None),
        }
    }

    fn read_line<'a>(buf: &mut Cursor<&'a [u8]>) -> Option<&'a [u8]> {
        let start = buf.position() as usize;
        let slice: &'a [u8] = *buf.get_ref();

        let end = slice[start..]
            .windows(2)
            .position(|w| w == CRLF)
            .map(|offset| start + offset)?;
        buf.set_position((end + 2) as u64);
        Some(&slice[start..end])
    }
}
