use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{Error, ErrorKind};

/// Magic constant prefacing every protocol frame.
pub const MAGIC_NUMBER: u32 = 0xde1c3230;

/// Size of the fixed frame header on the wire.
pub const RAW_MESSAGE_SIZE: usize = 13;

const MSG_REQUEST: u8 = 0;
const MSG_RESPONSE_OK: u8 = 1;
const MSG_RESPONSE_NA: u8 = 2;

/// A protocol frame header. `ResponseOk` is followed on the wire by the raw
/// block bytes; their length is not part of the frame, the receiver derives
/// it from its own torrent descriptor.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Message {
    Request(u64),
    ResponseOk(u64),
    ResponseNa(u64),
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Request(_) => MSG_REQUEST,
            Message::ResponseOk(_) => MSG_RESPONSE_OK,
            Message::ResponseNa(_) => MSG_RESPONSE_NA,
        }
    }

    pub fn block_number(&self) -> u64 {
        match *self {
            Message::Request(n) | Message::ResponseOk(n) | Message::ResponseNa(n) => n,
        }
    }

    /// Encodes the 13-byte header: magic big-endian, one code byte, block
    /// number little-endian (the byte order the reference peers put on the
    /// wire).
    pub fn serialize(&self) -> [u8; RAW_MESSAGE_SIZE] {
        let mut buf = [0u8; RAW_MESSAGE_SIZE];
        buf[..4].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
        buf[4] = self.code();
        buf[5..].copy_from_slice(&self.block_number().to_le_bytes());
        buf
    }

    /// Decodes a received header, rejecting a wrong magic or an unknown
    /// code. The block number is not range-checked here; only the engines
    /// know the block count of the torrent at hand.
    pub fn deserialize(data: &[u8; RAW_MESSAGE_SIZE]) -> Result<Message, Error> {
        let mut reader = &data[..];
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != MAGIC_NUMBER {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad magic number {magic:#010x}"),
            ));
        }
        let code = reader.read_u8()?;
        let block_number = reader.read_u64::<LittleEndian>()?;
        let message = match code {
            MSG_REQUEST => Message::Request(block_number),
            MSG_RESPONSE_OK => Message::ResponseOk(block_number),
            MSG_RESPONSE_NA => Message::ResponseNa(block_number),
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown message code {code}"),
                ));
            }
        };
        Ok(message)
    }
}
