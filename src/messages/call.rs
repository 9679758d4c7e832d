use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::checksum::Checksum;
use crate::error::ProtocolError;
use crate::messages::codec::{headers1_len, put_args, put_headers1, put_str1, PayloadReader};
use crate::messages::{Headers, MessageType, Tracing, FLAG_FRAGMENT};


/// transport header carrying the retry flag of a request
pub const HEADER_RETRY_FLAGS: &str = "re";
/// transport header carrying the arg scheme, e.g. `raw`
pub const HEADER_ARG_SCHEME: &str = "as";
/// transport header carrying the caller's process / service name
pub const HEADER_CALLER_NAME: &str = "cn";

fn arg(args: &[Bytes], idx: usize) -> &[u8] {
    args.get(idx)
        .map(|a| &a[..])
        .unwrap_or_default()
}

/// ```ascii
/// flags:1 ttl:4 tracing:25 service~1 nh:1 (hk~1 hv~1){nh} csumtype:1 (csum:4){0,1} (arg~2)*
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallRequest {
    pub flags: u8,
    /// time to live in milliseconds
    pub ttl: u32,
    pub tracing: Tracing,
    pub service: String,
    pub headers: Headers,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

impl CallRequest {
    pub fn new(service: &str, ttl: u32, headers: Headers, args: Vec<Bytes>) -> CallRequest {
        CallRequest {
            flags: 0,
            ttl,
            tracing: Tracing::default(),
            service: service.to_string(),
            headers,
            checksum: Checksum::None,
            args,
        }
    }

    pub fn arg1(&self) -> &[u8] { arg(&self.args, 0) }
    pub fn arg2(&self) -> &[u8] { arg(&self.args, 1) }
    pub fn arg3(&self) -> &[u8] { arg(&self.args, 2) }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len_without_args(&self) -> usize {
        1 + 4 + Tracing::SERIALIZED_LEN + 1 + self.service.len() + headers1_len(&self.headers) + self.checksum.serialized_len()
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.flags);
        buf.put_u32(self.ttl);
        self.tracing.ser(buf);
        put_str1(buf, "service", &self.service)?;
        put_headers1(buf, &self.headers)?;
        self.checksum.ser(buf);
        put_args(buf, &self.args)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<CallRequest, ProtocolError> {
        Ok(CallRequest {
            flags: reader.u8()?,
            ttl: reader.u32()?,
            tracing: Tracing::deser(reader)?,
            service: reader.str1("service")?,
            headers: reader.headers1()?,
            checksum: Checksum::deser(reader)?,
            args: reader.args()?,
        })
    }
}

/// Application level outcome of a call, independent of protocol errors
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    Error = 0x01,
}

/// ```ascii
/// flags:1 code:1 tracing:25 nh:1 (hk~1 hv~1){nh} csumtype:1 (csum:4){0,1} (arg~2)*
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallResponse {
    pub flags: u8,
    pub code: ResponseCode,
    pub tracing: Tracing,
    pub headers: Headers,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

impl CallResponse {
    pub fn new(code: ResponseCode, headers: Headers, args: Vec<Bytes>) -> CallResponse {
        CallResponse {
            flags: 0,
            code,
            tracing: Tracing::default(),
            headers,
            checksum: Checksum::None,
            args,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    pub fn arg1(&self) -> &[u8] { arg(&self.args, 0) }
    pub fn arg2(&self) -> &[u8] { arg(&self.args, 1) }
    pub fn arg3(&self) -> &[u8] { arg(&self.args, 2) }

    pub fn len_without_args(&self) -> usize {
        1 + 1 + Tracing::SERIALIZED_LEN + headers1_len(&self.headers) + self.checksum.serialized_len()
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.flags);
        buf.put_u8(self.code.into());
        self.tracing.ser(buf);
        put_headers1(buf, &self.headers)?;
        self.checksum.ser(buf);
        put_args(buf, &self.args)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<CallResponse, ProtocolError> {
        let flags = reader.u8()?;
        // any non-zero code is an application error
        let code = match reader.u8()? {
            0 => ResponseCode::Ok,
            _ => ResponseCode::Error,
        };
        Ok(CallResponse {
            flags,
            code,
            tracing: Tracing::deser(reader)?,
            headers: reader.headers1()?,
            checksum: Checksum::deser(reader)?,
            args: reader.args()?,
        })
    }
}

/// Payload of both CALL_REQ_CONTINUE and CALL_RES_CONTINUE:
///
/// ```ascii
/// flags:1 csumtype:1 (csum:4){0,1} (arg~2)*
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallContinue {
    pub flags: u8,
    pub checksum: Checksum,
    pub args: Vec<Bytes>,
}

impl CallContinue {
    pub fn new(flags: u8, checksum: Checksum, args: Vec<Bytes>) -> CallContinue {
        CallContinue { flags, checksum, args }
    }

    pub fn is_fragment(&self) -> bool {
        self.flags & FLAG_FRAGMENT != 0
    }

    pub fn len_without_args(&self) -> usize {
        1 + self.checksum.serialized_len()
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.flags);
        self.checksum.ser(buf);
        put_args(buf, &self.args)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<CallContinue, ProtocolError> {
        Ok(CallContinue {
            flags: reader.u8()?,
            checksum: Checksum::deser(reader)?,
            args: reader.args()?,
        })
    }
}

/// The message type a continuation of `message_type` is sent as
pub fn continue_type(message_type: MessageType) -> Option<MessageType> {
    match message_type {
        MessageType::CallRequest | MessageType::CallRequestContinue => Some(MessageType::CallRequestContinue),
        MessageType::CallResponse | MessageType::CallResponseContinue => Some(MessageType::CallResponseContinue),
        _ => None,
    }
}
