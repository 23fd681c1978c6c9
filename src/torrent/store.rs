use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use protocol::bitfield::Bitfield;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::metainfo::PieceDescriptor;

/// Result of feeding one block into the store.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// More blocks are needed; `received` bytes are buffered so far.
    Pending { received: u32 },
    /// The piece hashed correctly and is on disk.
    Verified { length: u32 },
    /// The piece was complete but its hash did not match. Nothing was written.
    Corrupted,
}

/// Buffers in-progress pieces, verifies completed ones and writes them to the
/// destination file at `piece_length * index`.
#[derive(Debug)]
pub struct PieceStore {
    path: PathBuf,
    file: File,
    piece_length: u64,
    pieces: Vec<PieceDescriptor>,
    buffers: HashMap<u32, Vec<u8>>,
}

impl PieceStore {
    /// Opens or creates the destination file and sizes it to the torrent's total length.
    pub fn open<P: AsRef<Path>>(
        path: P,
        piece_length: u64,
        pieces: Vec<PieceDescriptor>,
    ) -> Result<PieceStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent_dir) = path.parent() {
            if !parent_dir.as_os_str().is_empty() {
                fs::create_dir_all(parent_dir)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let total_length: u64 = pieces.iter().map(|p| p.length as u64).sum();
        if file.metadata()?.len() != total_length {
            file.set_len(total_length)?;
        }

        debug!(path = %path.display(), total_length, "Opened destination file");

        Ok(PieceStore {
            path,
            file,
            piece_length,
            pieces,
            buffers: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: u32) -> Option<&PieceDescriptor> {
        self.pieces.get(index as usize)
    }

    pub fn total_length(&self) -> u64 {
        self.pieces.iter().map(|p| p.length as u64).sum()
    }

    /// Appends a block to the buffer for `index`.
    ///
    /// Blocks must arrive at contiguous, increasing offsets starting from 0. A block at
    /// any other offset, or one that runs past the piece's expected length, discards the
    /// buffer and is reported as an error.
    pub fn accept_block(
        &mut self,
        index: u32,
        offset: u32,
        block: &[u8],
    ) -> Result<BlockOutcome, StoreError> {
        let descriptor = self
            .pieces
            .get(index as usize)
            .ok_or(StoreError::UnknownPiece(index))?;
        let expected_length = descriptor.length as usize;

        let buffer = self
            .buffers
            .entry(index)
            .or_insert_with(|| Vec::with_capacity(expected_length));

        if offset as usize != buffer.len() {
            let expected = buffer.len() as u32;
            self.buffers.remove(&index);
            return Err(StoreError::UnexpectedOffset {
                index,
                expected,
                got: offset,
            });
        }

        if buffer.len() + block.len() > expected_length {
            self.buffers.remove(&index);
            return Err(StoreError::Overflow { index });
        }

        buffer.extend_from_slice(block);
        if buffer.len() < expected_length {
            return Ok(BlockOutcome::Pending {
                received: buffer.len() as u32,
            });
        }

        let data = self.buffers.remove(&index).unwrap_or_default();
        let expected_hash = descriptor.hash;
        if !is_valid_piece(&expected_hash, &data) {
            warn!(piece_index = index, "Piece failed hash check");
            return Ok(BlockOutcome::Corrupted);
        }

        self.write_piece(index, &data)?;
        debug!(piece_index = index, length = data.len(), "Piece verified and written");

        Ok(BlockOutcome::Verified {
            length: data.len() as u32,
        })
    }

    /// Reads `length` bytes at `offset` within a piece.
    pub fn read_range(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>, StoreError> {
        let descriptor = self
            .pieces
            .get(index as usize)
            .ok_or(StoreError::UnknownPiece(index))?;

        if offset as u64 + length as u64 > descriptor.length as u64 {
            return Err(StoreError::OutOfBounds {
                index,
                offset,
                length,
            });
        }

        let position = self.piece_length * index as u64 + offset as u64;
        let mut data = vec![0u8; length as usize];
        self.file.read_exact_at(&mut data, position)?;

        Ok(data)
    }

    /// Drops the partial buffer for `index`. Returns whether one existed.
    pub fn discard(&mut self, index: u32) -> bool {
        self.buffers.remove(&index).is_some()
    }

    pub fn is_buffered(&self, index: u32) -> bool {
        self.buffers.contains_key(&index)
    }

    /// Re-hashes every piece already present in the file.
    pub fn scan_existing(&self) -> Result<Bitfield, StoreError> {
        let mut bitfield = Bitfield::new(self.pieces.len());

        for descriptor in &self.pieces {
            let position = self.piece_length * descriptor.index as u64;
            let mut data = vec![0u8; descriptor.length as usize];

            match self.file.read_exact_at(&mut data, position) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if is_valid_piece(&descriptor.hash, &data) {
                bitfield.set_piece(descriptor.index as usize);
            }
        }

        info!(
            verified = bitfield.count(),
            total = self.pieces.len(),
            "Scanned existing data"
        );
        Ok(bitfield)
    }

    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StoreError> {
        let position = self.piece_length * index as u64;
        self.file.write_all_at(data, position)?;
        Ok(())
    }
}

fn is_valid_piece(piece_hash: &[u8; 20], piece_bytes: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(piece_bytes);
    let hash = hasher.finalize();

    piece_hash[..] == hash[..]
}

#[derive(Debug)]
pub enum StoreError {
    UnknownPiece(u32),
    UnexpectedOffset { index: u32, expected: u32, got: u32 },
    Overflow { index: u32 },
    OutOfBounds { index: u32, offset: u32, length: u32 },
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnknownPiece(index) => write!(f, "Unknown piece {}", index),
            StoreError::UnexpectedOffset {
                index,
                expected,
                got,
            } => write!(
                f,
                "Block for piece {} at offset {}, expected {}",
                index, got, expected
            ),
            StoreError::Overflow { index } => {
                write!(f, "Block overflows the length of piece {}", index)
            }
            StoreError::OutOfBounds {
                index,
                offset,
                length,
            } => write!(
                f,
                "Range {}+{} is outside piece {}",
                offset, length, index
            ),
            StoreError::Io(e) => write!(f, "Disk I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

#[cfg(test)]
impl PieceStore {
    /// Swaps the handle for a read-only one so every piece write fails.
    pub(crate) fn reopen_read_only(&mut self) -> io::Result<()> {
        self.file = File::open(&self.path)?;
        Ok(())
    }
}
