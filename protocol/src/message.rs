use crate::error::MessageError;

/// Largest length prefix accepted from a peer: a 1 MiB block plus the Piece header.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024 + 9;

/// Identifies the type of a peer wire protocol message.
///
/// KeepAlive carries no tag on the wire and therefore has no `MessageId`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageId {
    /// Choke message: <len=0001><id=0>
    Choke = 0,
    /// Unchoke message: <len=0001><id=1>
    Unchoke = 1,
    /// Interested message: <len=0001><id=2>
    Interested = 2,
    /// Not Interested message: <len=0001><id=3>
    NotInterested = 3,
    /// Have message: <len=0005><id=4><piece index>
    Have = 4,
    /// Bitfield message: <len=0001+X><id=5><bitfield>
    Bitfield = 5,
    /// Request message: <len=0013><id=6><index><begin><length>
    Request = 6,
    /// Piece message: <len=0009+X><id=7><index><begin><block>
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            _ => Err(MessageError::InvalidMessageId(value)),
        }
    }
}

/// A decoded peer wire protocol message.
///
/// The length prefix is derived from the variant when encoding, so a frame whose prefix
/// disagrees with its payload cannot be constructed.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bits: Vec<u8> },
    Request(TransferPayload),
    Piece(PiecePayload),
}

impl Message {
    /// Returns the wire tag, or `None` for KeepAlive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece(_) => Some(MessageId::Piece),
        }
    }

    /// Value of the 4-byte length prefix: tag byte plus payload, or 0 for KeepAlive.
    pub fn length_prefix(&self) -> u32 {
        let payload = match self {
            Message::KeepAlive => return 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield { bits } => bits.len(),
            Message::Request(_) => TransferPayload::SIZE,
            Message::Piece(payload) => 8 + payload.block.len(),
        };
        (1 + payload) as u32
    }

    /// Serializes the message into its framed wire representation.
    ///
    /// Format: <length prefix (4 bytes)><message ID (1 byte)><payload (variable)>
    pub fn serialize(&self) -> Vec<u8> {
        let length = self.length_prefix();
        let mut bytes = Vec::with_capacity(4 + length as usize);
        bytes.extend_from_slice(&length.to_be_bytes());

        let Some(id) = self.id() else {
            return bytes;
        };
        bytes.push(id as u8);

        match self {
            Message::Have { index } => bytes.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield { bits } => bytes.extend_from_slice(bits),
            Message::Request(payload) => bytes.extend_from_slice(&payload.serialize()),
            Message::Piece(payload) => bytes.extend_from_slice(&payload.serialize()),
            _ => {}
        }

        bytes
    }

    /// Deserializes one framed message from the front of `buffer`.
    ///
    /// Trailing bytes beyond the frame announced by the prefix are ignored.
    pub fn deserialize(buffer: &[u8]) -> Result<Message, MessageError> {
        if buffer.len() < 4 {
            return Err(MessageError::BufferTooShort);
        }

        let length_prefix = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let length_prefix = check_length_prefix(length_prefix)?;
        if length_prefix == 0 {
            return Ok(Message::KeepAlive);
        }

        let total_length = 4 + length_prefix;
        if buffer.len() < total_length {
            return Err(MessageError::BufferTooShort);
        }

        Self::from_body(&buffer[4..total_length])
    }

    /// Decodes a non-empty frame body: the tag byte followed by its payload.
    ///
    /// The body length is the frame's length prefix, and must match the size the tag
    /// requires.
    pub fn from_body(body: &[u8]) -> Result<Message, MessageError> {
        let (&tag, payload) = body.split_first().ok_or(MessageError::BufferTooShort)?;
        let message_id = MessageId::try_from(tag)?;

        let invalid = || MessageError::InvalidLength {
            message_id: tag,
            length: body.len(),
        };

        match message_id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => {
                if !payload.is_empty() {
                    return Err(invalid());
                }
                Ok(match message_id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            MessageId::Have => {
                let index: [u8; 4] = payload.try_into().map_err(|_| invalid())?;
                Ok(Message::Have {
                    index: u32::from_be_bytes(index),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield {
                bits: payload.to_vec(),
            }),
            MessageId::Request => {
                if payload.len() != TransferPayload::SIZE {
                    return Err(invalid());
                }
                Ok(Message::Request(TransferPayload::try_from(payload)?))
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(invalid());
                }
                Ok(Message::Piece(PiecePayload::try_from(payload)?))
            }
        }
    }
}

/// Validates a length prefix read off the wire before anything is allocated for it.
pub fn check_length_prefix(length_prefix: u32) -> Result<usize, MessageError> {
    let length = length_prefix as usize;
    if length > MAX_FRAME_LENGTH {
        return Err(MessageError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Payload of a Request message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferPayload {
    /// The zero-based piece index
    pub index: u32,
    /// The zero-based byte offset within the piece
    pub begin: u32,
    /// The requested length in bytes
    pub length: u32,
}

impl TransferPayload {
    pub const SIZE: usize = 12;

    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    /// Format: <index (4 bytes)><begin (4 bytes)><length (4 bytes)>
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes
    }
}

impl TryFrom<&[u8]> for TransferPayload {
    type Error = MessageError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < Self::SIZE {
            return Err(MessageError::BufferTooShort);
        }

        Ok(Self {
            index: read_u32(&bytes[0..4]),
            begin: read_u32(&bytes[4..8]),
            length: read_u32(&bytes[8..12]),
        })
    }
}

/// Payload of a Piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiecePayload {
    /// The zero-based piece index
    pub index: u32,
    /// The zero-based byte offset within the piece
    pub begin: u32,
    /// The actual block data
    pub block: Vec<u8>,
}

impl PiecePayload {
    pub fn new(index: u32, begin: u32, block: Vec<u8>) -> Self {
        Self {
            index,
            begin,
            block,
        }
    }

    /// Format: <index (4 bytes)><begin (4 bytes)><block (variable)>
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.block.len());
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.block);
        bytes
    }
}

impl TryFrom<&[u8]> for PiecePayload {
    type Error = MessageError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < 8 {
            return Err(MessageError::BufferTooShort);
        }

        Ok(Self {
            index: read_u32(&bytes[0..4]),
            begin: read_u32(&bytes[4..8]),
            block: bytes[8..].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}
