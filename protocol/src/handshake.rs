use crate::error::HandshakeError;

pub const PSTR: &str = "BitTorrent protocol";

/// Size of a serialized handshake: pstrlen, pstr, reserved, info hash and peer id.
pub const HANDSHAKE_LEN: usize = 1 + PSTR.len() + 8 + 20 + 20;

/// The fixed-size greeting both sides exchange before any length-prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        buf.push(PSTR.len() as u8);
        buf.extend_from_slice(PSTR.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);

        buf
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Handshake, HandshakeError> {
        if buffer.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::InvalidLength);
        }

        let pstr_length = buffer[0] as usize;
        if pstr_length != PSTR.len() {
            return Err(HandshakeError::InvalidPstrLength);
        }

        let mut offset = 1;
        if &buffer[offset..offset + pstr_length] != PSTR.as_bytes() {
            return Err(HandshakeError::InvalidPstr);
        }
        offset += pstr_length;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buffer[offset..offset + 8]);
        offset += 8;

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buffer[offset..offset + 20]);
        offset += 20;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buffer[offset..offset + 20]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Fails with `InfoHashMismatch` unless the remote side named the same torrent.
    pub fn verify(&self, info_hash: &[u8; 20]) -> Result<(), HandshakeError> {
        if &self.info_hash != info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(())
    }
}
