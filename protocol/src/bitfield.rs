/// Piece-availability bitmap, most significant bit of byte 0 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Creates an all-false bitfield sized for `num_pieces`.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Builds a bitfield from a peer's raw payload.
    ///
    /// The payload is padded or truncated to the expected byte count. Spare bits past
    /// `num_pieces` are cleared.
    pub fn from_bytes(raw: &[u8], num_pieces: usize) -> Self {
        let mut bytes = vec![0; num_pieces.div_ceil(8)];
        let len = bytes.len().min(raw.len());
        bytes[..len].copy_from_slice(&raw[..len]);

        if num_pieces % 8 != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xFFu8 << (8 - (num_pieces % 8));
            }
        }

        Self { bytes, num_pieces }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bytes[index / 8] & (1 << (7 - (index % 8))) != 0
    }

    /// Sets the bit for `index`; out-of-range indices are ignored.
    pub fn set_piece(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bytes[index / 8] |= 1 << (7 - (index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn first_missing(&self) -> Option<usize> {
        (0..self.num_pieces).find(|&i| !self.has_piece(i))
    }

    /// True when this bitfield holds at least one piece that `local` lacks.
    pub fn has_piece_missing_from(&self, local: &Bitfield) -> bool {
        self.bytes
            .iter()
            .zip(local.bytes.iter())
            .any(|(theirs, ours)| theirs & !ours != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_ordering() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set_piece(0);
        bitfield.set_piece(9);

        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitfield.has_piece(0));
        assert!(!bitfield.has_piece(1));
        assert!(bitfield.has_piece(9));
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::new(3);
        bitfield.set_piece(3);
        assert!(bitfield.is_empty());
        assert!(!bitfield.has_piece(100));
    }

    #[test]
    fn test_from_bytes_clears_spare_bits_and_pads() {
        let bitfield = Bitfield::from_bytes(&[0xFF], 5);
        assert_eq!(bitfield.as_bytes(), &[0b1111_1000]);
        assert!(bitfield.is_complete());

        let bitfield = Bitfield::from_bytes(&[0xFF], 12);
        assert_eq!(bitfield.as_bytes(), &[0xFF, 0x00]);
        assert_eq!(bitfield.first_missing(), Some(8));
    }

    #[test]
    fn test_completion_and_first_missing() {
        let mut bitfield = Bitfield::new(9);
        for i in 0..8 {
            bitfield.set_piece(i);
        }
        assert!(!bitfield.is_complete());
        assert_eq!(bitfield.first_missing(), Some(8));

        bitfield.set_piece(8);
        assert!(bitfield.is_complete());
        assert_eq!(bitfield.first_missing(), None);
    }

    #[test]
    fn test_has_piece_missing_from() {
        let mut local = Bitfield::new(4);
        local.set_piece(0);

        let mut remote = Bitfield::new(4);
        remote.set_piece(0);
        assert!(!remote.has_piece_missing_from(&local));

        remote.set_piece(2);
        assert!(remote.has_piece_missing_from(&local));
    }
}
