use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::checksum::ChecksumType;
use crate::connection::ConnectionState;
use crate::messages::MessageType;


/// Error codes carried in ERROR frames. `0x00` is not a valid code.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ErrorCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    Unexpected = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    Unhealthy = 0x08,
    Fatal = 0xFF,
}

/// Violations of the wire protocol, detected locally while encoding or decoding.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the maximum frame size of 65535 bytes")]
    OversizeFrame { size: usize },
    #[error("frame size field {size} is smaller than the frame header")]
    InvalidFrameSize { size: usize },
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("payload of {message_type:?} message does not match its declared size")]
    TruncatedPayload { message_type: MessageType },
    #[error("field {field} is too long: {len} bytes/entries, at most {max} allowed")]
    FieldTooLong { field: &'static str, len: usize, max: usize },
    #[error("duplicate header key {0:?}")]
    DuplicateHeaderKey(String),
    #[error("invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid error code 0x{0:02x}")]
    InvalidErrorCode(u8),
    #[error("unknown checksum type 0x{0:02x}")]
    UnknownChecksumType(u8),
    #[error("checksum type {0:?} is not supported")]
    UnsupportedChecksumType(ChecksumType),
    #[error("checksum mismatch: message carries {expected:?}, computed {actual:?}")]
    InvalidChecksum { expected: Option<u32>, actual: Option<u32> },
    #[error("a frame may carry at most three args, got {0}")]
    TooManyArgs(usize),
    #[error("missing required handshake header: {0}")]
    MissingHandshakeHeader(&'static str),
    #[error("expected a handshake message, got {0:?}")]
    UnexpectedHandshakeMessage(MessageType),
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u16),
    #[error("{0:?} messages are not sent through a pending call")]
    NotARequest(MessageType),
    #[error("{0}")]
    StreamingProtocolError(String),
    #[error("message id space of this connection is exhausted")]
    IdSpaceExhausted,
}

/// Everything that can go wrong with a call or a connection.
#[derive(Debug, Error)]
pub enum TChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The remote side answered with an ERROR frame. This is data, not a local defect.
    #[error("remote error {code:?}: {description}")]
    Remote { code: ErrorCode, description: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("no peer available for the request")]
    NoAvailablePeer,
    #[error("operation not allowed in connection state {0:?}")]
    InvalidState(ConnectionState),
}

impl TChannelError {
    /// The error code a failed attempt counts as when deciding about retries. `None` means the
    ///  error is surfaced to the caller without retrying.
    pub fn retry_code(&self) -> Option<ErrorCode> {
        match self {
            TChannelError::Remote { code, .. } => Some(*code),
            TChannelError::Timeout(_) => Some(ErrorCode::Timeout),
            TChannelError::Io(_) | TChannelError::ConnectionClosed(_) => Some(ErrorCode::NetworkError),
            TChannelError::Protocol(_) | TChannelError::NoAvailablePeer | TChannelError::InvalidState(_) => None,
        }
    }
}

pub type TChannelResult<T> = Result<T, TChannelError>;
