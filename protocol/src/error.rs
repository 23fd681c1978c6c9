use std::{fmt, io};

/// Errors produced while decoding a peer wire frame.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageError {
    /// Buffer is too short to contain the frame announced by its length prefix
    BufferTooShort,
    /// The tag byte does not name one of the supported messages
    InvalidMessageId(u8),
    /// The length prefix disagrees with the payload size required by the tag
    InvalidLength { message_id: u8, length: usize },
    /// The length prefix exceeds the largest frame this client accepts
    FrameTooLarge(usize),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "Buffer too short for complete message"),
            Self::InvalidMessageId(id) => write!(f, "Invalid message ID: {}", id),
            Self::InvalidLength { message_id, length } => write!(
                f,
                "Invalid length prefix {} for message ID {}",
                length, message_id
            ),
            Self::FrameTooLarge(length) => write!(f, "Frame of {} bytes is too large", length),
        }
    }
}

impl std::error::Error for MessageError {}

/// Errors produced while exchanging the 68-byte handshake.
#[derive(Debug)]
pub enum HandshakeError {
    InvalidPstrLength,
    InvalidPstr,
    InvalidLength,
    InfoHashMismatch,
    Timeout,
    Io(io::Error),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidPstrLength => {
                write!(f, "Peer responded with invalid PSTR length")
            }
            HandshakeError::InvalidPstr => write!(f, "Peer responded with unknown protocol"),
            HandshakeError::InvalidLength => {
                write!(f, "Invalid handshake length, must be 68 bytes long")
            }
            HandshakeError::InfoHashMismatch => {
                write!(f, "Peer handshake carries a different info hash")
            }
            HandshakeError::Timeout => write!(f, "Timed out waiting for handshake"),
            HandshakeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        HandshakeError::Io(err)
    }
}
