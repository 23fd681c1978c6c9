use std::{fmt, fs, io, path::Path};

use serde::Deserialize;
use serde_bencode::{de, ser, value::Value};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

/// Expected length and hash of one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDescriptor {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}

/// The parts of a single-file torrent this client needs.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub info_hash: [u8; 20],
    pub total_length: u64,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

#[derive(Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    info: Value,
}

#[derive(Deserialize)]
struct Info {
    name: String,
    length: Option<u64>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
    files: Option<Value>,
}

impl Metainfo {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Metainfo, MetainfoError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Decodes a torrent file. The info hash is the SHA-1 of the bencoded `info`
    /// dictionary.
    pub fn from_bytes(data: &[u8]) -> Result<Metainfo, MetainfoError> {
        let raw: RawMetainfo = de::from_bytes(data)?;
        let info_bytes = ser::to_bytes(&raw.info)?;

        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let info: Info = de::from_bytes(&info_bytes)?;
        if info.files.is_some() {
            return Err(MetainfoError::MultiFileUnsupported);
        }

        let announce = raw.announce.ok_or(MetainfoError::MissingField("announce"))?;
        let total_length = info.length.ok_or(MetainfoError::MissingField("length"))?;
        if info.piece_length == 0 || info.piece_length > u32::MAX as u64 {
            return Err(MetainfoError::InvalidPieces("bad piece length"));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieces(
                "piece hashes are not a multiple of 20 bytes",
            ));
        }

        let piece_hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        if piece_hashes.len() as u64 != total_length.div_ceil(info.piece_length) {
            return Err(MetainfoError::InvalidPieces(
                "piece count does not match the file length",
            ));
        }

        Ok(Metainfo {
            announce,
            name: info.name,
            info_hash,
            total_length,
            piece_length: info.piece_length,
            piece_hashes,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; the last one holds whatever remains of the file.
    pub fn piece_len(&self, index: usize) -> u32 {
        piece_len(self.total_length, self.piece_length, index)
    }

    pub fn pieces(&self) -> Vec<PieceDescriptor> {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| PieceDescriptor {
                index: index as u32,
                length: self.piece_len(index),
                hash: *hash,
            })
            .collect()
    }
}

/// Length of piece `index` of a file of `total_length` bytes.
pub fn piece_len(total_length: u64, piece_length: u64, index: usize) -> u32 {
    let start = piece_length * index as u64;
    let remaining = total_length.saturating_sub(start);
    remaining.min(piece_length) as u32
}

#[derive(Debug)]
pub enum MetainfoError {
    Io(io::Error),
    Decode(serde_bencode::Error),
    MissingField(&'static str),
    InvalidPieces(&'static str),
    MultiFileUnsupported,
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetainfoError::Io(e) => write!(f, "Failed to read torrent file: {}", e),
            MetainfoError::Decode(e) => write!(f, "Failed to decode torrent file: {}", e),
            MetainfoError::MissingField(field) => write!(f, "Torrent is missing `{}`", field),
            MetainfoError::InvalidPieces(reason) => write!(f, "Invalid pieces: {}", reason),
            MetainfoError::MultiFileUnsupported => {
                write!(f, "Multi-file torrents are not supported")
            }
        }
    }
}

impl std::error::Error for MetainfoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetainfoError::Io(e) => Some(e),
            MetainfoError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MetainfoError {
    fn from(err: io::Error) -> Self {
        MetainfoError::Io(err)
    }
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(err: serde_bencode::Error) -> Self {
        MetainfoError::Decode(err)
    }
}
