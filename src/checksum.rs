use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;
use crate::messages::codec::PayloadReader;
use crate::messages::Message;


/// zlib's CRC-32, i.e. what `zlib.crc32(data, 0)` computes
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChecksumType {
    None = 0x00,
    Crc32 = 0x01,
    Farm32 = 0x02,
}

/// ```ascii
/// type:1 (value:4){0,1}
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Checksum {
    None,
    Crc32(u32),
    Farm32(u32),
}

impl Checksum {
    /// Checksum of the given type with a zero value, to be computed once the args are final
    pub fn empty(checksum_type: ChecksumType) -> Checksum {
        match checksum_type {
            ChecksumType::None => Checksum::None,
            ChecksumType::Crc32 => Checksum::Crc32(0),
            ChecksumType::Farm32 => Checksum::Farm32(0),
        }
    }

    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Checksum::None => ChecksumType::None,
            Checksum::Crc32(_) => ChecksumType::Crc32,
            Checksum::Farm32(_) => ChecksumType::Farm32,
        }
    }

    pub fn value(&self) -> Option<u32> {
        match self {
            Checksum::None => None,
            Checksum::Crc32(v) | Checksum::Farm32(v) => Some(*v),
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Checksum::None => 1,
            _ => 5,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.checksum_type().into());
        if let Some(value) = self.value() {
            buf.put_u32(value);
        }
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<Checksum, ProtocolError> {
        let raw = reader.u8()?;
        let checksum_type = ChecksumType::try_from(raw)
            .map_err(|_| ProtocolError::UnknownChecksumType(raw))?;
        Ok(match checksum_type {
            ChecksumType::None => Checksum::None,
            ChecksumType::Crc32 => Checksum::Crc32(reader.u32()?),
            ChecksumType::Farm32 => Checksum::Farm32(reader.u32()?),
        })
    }
}

pub fn crc32(args: &[Bytes]) -> u32 {
    let mut digest = CRC32.digest();
    for arg in args {
        digest.update(arg);
    }
    digest.finalize()
}

/// Computes a checksum over the args in order. Farm32 is not supported and fails rather than
///  being downgraded to no checksum.
pub fn compute(checksum_type: ChecksumType, args: &[Bytes]) -> Result<Checksum, ProtocolError> {
    match checksum_type {
        ChecksumType::None => Ok(Checksum::None),
        ChecksumType::Crc32 => Ok(Checksum::Crc32(crc32(args))),
        ChecksumType::Farm32 => Err(ProtocolError::UnsupportedChecksumType(checksum_type)),
    }
}

/// Recomputes the checksum of a call-family message over the args it currently carries, keeping
///  its checksum type. Other messages carry no checksum and are left unchanged.
pub fn compute_and_set(message: &mut Message) -> Result<(), ProtocolError> {
    if let Some((checksum, args)) = message.checksum_and_args_mut() {
        *checksum = compute(checksum.checksum_type(), args)?;
    }
    Ok(())
}

/// `true` if the message's checksum matches its args, or if the message type carries no checksum
pub fn verify(message: &Message) -> Result<bool, ProtocolError> {
    match message.checksum_and_args() {
        None => Ok(true),
        Some((checksum, args)) => Ok(compute(checksum.checksum_type(), args)? == *checksum),
    }
}

pub fn ensure_valid(message: &Message) -> Result<(), ProtocolError> {
    if let Some((checksum, args)) = message.checksum_and_args() {
        let actual = compute(checksum.checksum_type(), args)?;
        if actual != *checksum {
            return Err(ProtocolError::InvalidChecksum { expected: checksum.value(), actual: actual.value() });
        }
    }
    Ok(())
}
