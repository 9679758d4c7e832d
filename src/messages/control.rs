use bytes::{BufMut, BytesMut};

use crate::error::{ErrorCode, ProtocolError};
use crate::messages::codec::{put_str2, PayloadReader};
use crate::messages::Tracing;


/// ```ascii
/// code:1 tracing:25 message~2
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub tracing: Tracing,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: &str) -> ErrorMessage {
        ErrorMessage {
            code,
            tracing: Tracing::default(),
            message: message.to_string(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.code.into());
        self.tracing.ser(buf);
        put_str2(buf, "message", &self.message)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<ErrorMessage, ProtocolError> {
        let raw_code = reader.u8()?;
        let code = ErrorCode::try_from(raw_code)
            .map_err(|_| ProtocolError::InvalidErrorCode(raw_code))?;
        Ok(ErrorMessage {
            code,
            tracing: Tracing::deser(reader)?,
            message: reader.str2("message")?,
        })
    }
}

/// ```ascii
/// ttl:4 tracing:25 why~2
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CancelMessage {
    pub ttl: u32,
    pub tracing: Tracing,
    pub why: String,
}

impl CancelMessage {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.ttl);
        self.tracing.ser(buf);
        put_str2(buf, "why", &self.why)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<CancelMessage, ProtocolError> {
        Ok(CancelMessage {
            ttl: reader.u32()?,
            tracing: Tracing::deser(reader)?,
            why: reader.str2("why")?,
        })
    }
}

/// ```ascii
/// ttl:4 tracing:25
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClaimMessage {
    pub ttl: u32,
    pub tracing: Tracing,
}

impl ClaimMessage {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ttl);
        self.tracing.ser(buf);
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<ClaimMessage, ProtocolError> {
        Ok(ClaimMessage {
            ttl: reader.u32()?,
            tracing: Tracing::deser(reader)?,
        })
    }
}
