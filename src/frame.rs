use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{ProtocolError, TChannelError};
use crate::util::safe_converter::PrecheckedCast;


pub const FRAME_HEADER_SIZE: usize = 16;
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// `0xFFFFFFFF` is reserved and never assigned to a message by a connection
pub const RESERVED_MESSAGE_ID: u32 = 0xFFFF_FFFF;
pub const MAX_MESSAGE_ID: u32 = RESERVED_MESSAGE_ID - 1;

/// ```ascii
///  0: size (u16 BE) - total frame size, including this header
///  2: message type (u8)
///  3: reserved (u8), always 0
///  4: message id (u32 BE)
///  8: reserved (8 bytes), always 0
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub size: u16,
    pub message_type: u8,
    pub message_id: u32,
}

impl FrameHeader {
    pub const fn width() -> usize {
        FRAME_HEADER_SIZE
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - FRAME_HEADER_SIZE
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.size);
        buf.put_u8(self.message_type);
        buf.put_u8(0);
        buf.put_u32(self.message_id);
        buf.put_u64(0);
    }

    /// Parses the header *after* the size field, which the caller has already consumed to find
    ///  the frame's boundary.
    fn deser_after_size(size: u16, buf: &mut impl Buf) -> FrameHeader {
        let message_type = buf.get_u8();
        let _reserved = buf.get_u8();
        let message_id = buf.get_u32();
        buf.advance(8);
        FrameHeader {
            size,
            message_type,
            message_id,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, message_id: u32, payload: Bytes) -> Result<Frame, ProtocolError> {
        let size = FRAME_HEADER_SIZE + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizeFrame { size });
        }

        Ok(Frame {
            header: FrameHeader {
                size: size.prechecked_cast(),
                message_type,
                message_id,
            },
            payload,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(self.header.size as usize);
        self.header.ser(buf);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.size as usize);
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decodes a single frame from an in-memory buffer. An empty buffer is a clean end of input
    ///  and yields `None`.
    pub fn try_deser(buf: &mut impl Buf) -> Result<Option<Frame>, ProtocolError> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        if buf.remaining() < size_of::<u16>() {
            return Err(ProtocolError::TruncatedFrame { expected: size_of::<u16>(), actual: buf.remaining() });
        }

        let size = buf.get_u16();
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(ProtocolError::InvalidFrameSize { size: size as usize });
        }

        let rest = size as usize - size_of::<u16>();
        if buf.remaining() < rest {
            return Err(ProtocolError::TruncatedFrame { expected: size as usize, actual: buf.remaining() + size_of::<u16>() });
        }

        let header = FrameHeader::deser_after_size(size, buf);
        let payload = buf.copy_to_bytes(header.payload_len());
        Ok(Some(Frame { header, payload }))
    }
}

/// Reads the next frame from a byte stream.
///
/// Returns `None` if the stream was closed cleanly, i.e. before the first byte of a frame. A
///  stream ending anywhere inside a frame is a [ProtocolError::TruncatedFrame].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, TChannelError> {
    let mut size_buf = [0u8; 2];
    let num_read = read_fully(reader, &mut size_buf).await?;
    if num_read == 0 {
        return Ok(None);
    }
    if num_read < size_buf.len() {
        return Err(ProtocolError::TruncatedFrame { expected: size_buf.len(), actual: num_read }.into());
    }

    let size = u16::from_be_bytes(size_buf);
    if (size as usize) < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InvalidFrameSize { size: size as usize }.into());
    }

    let mut rest = vec![0u8; size as usize - size_buf.len()];
    let num_read = read_fully(reader, &mut rest).await?;
    if num_read < rest.len() {
        return Err(ProtocolError::TruncatedFrame { expected: size as usize, actual: num_read + size_buf.len() }.into());
    }

    let mut rest = Bytes::from(rest);
    let header = FrameHeader::deser_after_size(size, &mut rest);
    trace!(message_type = header.message_type, message_id = header.message_id, size, "read frame");
    Ok(Some(Frame { header, payload: rest }))
}

/// like `read_exact`, but reports how many bytes were available before EOF instead of failing
async fn read_fully<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
