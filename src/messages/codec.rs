//! Primitive field codecs that all message layouts are composed of. Notation follows the protocol
//!  documentation: `name:N` is a fixed-width big-endian number of N bytes, `name~N` is a byte
//!  sequence preceded by its length as an N-byte number.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashSet;

use crate::error::ProtocolError;
use crate::messages::{Headers, MessageType};
use crate::util::safe_converter::PrecheckedCast;


/// Reads fields from a frame payload, reporting underflow as a truncated payload of the
///  message type being decoded.
pub struct PayloadReader {
    buf: Bytes,
    message_type: MessageType,
}

impl PayloadReader {
    pub fn new(buf: Bytes, message_type: MessageType) -> PayloadReader {
        PayloadReader { buf, message_type }
    }

    fn truncated(&self) -> ProtocolError {
        ProtocolError::TruncatedPayload { message_type: self.message_type }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.buf.try_get_u8().map_err(|_| self.truncated())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.buf.try_get_u16().map_err(|_| self.truncated())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.buf.try_get_u32().map_err(|_| self.truncated())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.buf.try_get_u64().map_err(|_| self.truncated())
    }

    pub fn bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        if self.buf.remaining() < len {
            return Err(self.truncated());
        }
        Ok(self.buf.split_to(len))
    }

    /// `s~1`
    pub fn str1(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u8()? as usize;
        self.string(len, field)
    }

    /// `s~2`
    pub fn str2(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        self.string(len, field)
    }

    fn string(&mut self, len: usize, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    /// `arg~2`
    pub fn arg(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    /// `(arg~2)*` - args extend to the end of the payload
    pub fn args(&mut self) -> Result<Vec<Bytes>, ProtocolError> {
        let mut args = Vec::with_capacity(3);
        while self.remaining() > 0 {
            args.push(self.arg()?);
        }
        if args.len() > 3 {
            return Err(ProtocolError::TooManyArgs(args.len()));
        }
        Ok(args)
    }

    /// `nh:1 (k~1 v~1){nh}`
    pub fn headers1(&mut self) -> Result<Headers, ProtocolError> {
        let num_headers = self.u8()? as usize;
        self.headers(num_headers, Self::str1)
    }

    /// `nh:2 (k~2 v~2){nh}`
    pub fn headers2(&mut self) -> Result<Headers, ProtocolError> {
        let num_headers = self.u16()? as usize;
        self.headers(num_headers, Self::str2)
    }

    fn headers(&mut self, num_headers: usize, read_str: fn(&mut Self, &'static str) -> Result<String, ProtocolError>) -> Result<Headers, ProtocolError> {
        let mut headers = Vec::with_capacity(num_headers);
        let mut seen = FxHashSet::default();
        for _ in 0..num_headers {
            let key = read_str(self, "header key")?;
            let value = read_str(self, "header value")?;
            if !seen.insert(key.clone()) {
                return Err(ProtocolError::DuplicateHeaderKey(key));
            }
            headers.push((key, value));
        }
        Ok(headers)
    }

    /// Fails if the payload was not consumed completely
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            tracing::debug!(message_type = ?self.message_type, remaining = self.buf.remaining(), "unconsumed bytes after decoding payload");
            return Err(self.truncated());
        }
        Ok(())
    }
}


fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    Ok(())
}

pub fn put_str1(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), ProtocolError> {
    check_len(field, s.len(), u8::MAX as usize)?;
    buf.put_u8(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_str2(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), ProtocolError> {
    check_len(field, s.len(), u16::MAX as usize)?;
    buf.put_u16(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_arg(buf: &mut BytesMut, arg: &[u8]) -> Result<(), ProtocolError> {
    check_len("arg", arg.len(), u16::MAX as usize)?;
    buf.put_u16(arg.len().prechecked_cast());
    buf.put_slice(arg);
    Ok(())
}

pub fn put_args(buf: &mut BytesMut, args: &[Bytes]) -> Result<(), ProtocolError> {
    if args.len() > 3 {
        return Err(ProtocolError::TooManyArgs(args.len()));
    }
    for arg in args {
        put_arg(buf, arg)?;
    }
    Ok(())
}

pub fn put_headers1(buf: &mut BytesMut, headers: &Headers) -> Result<(), ProtocolError> {
    check_len("headers", headers.len(), u8::MAX as usize)?;
    buf.put_u8(headers.len().prechecked_cast());
    for (key, value) in headers {
        put_str1(buf, "header key", key)?;
        put_str1(buf, "header value", value)?;
    }
    Ok(())
}

pub fn put_headers2(buf: &mut BytesMut, headers: &Headers) -> Result<(), ProtocolError> {
    check_len("headers", headers.len(), u16::MAX as usize)?;
    buf.put_u16(headers.len().prechecked_cast());
    for (key, value) in headers {
        put_str2(buf, "header key", key)?;
        put_str2(buf, "header value", value)?;
    }
    Ok(())
}

pub fn headers1_len(headers: &Headers) -> usize {
    1 + headers.iter()
        .map(|(k, v)| 2 + k.len() + v.len())
        .sum::<usize>()
}
