use std::collections::HashSet;

use protocol::{bitfield::Bitfield, message::TransferPayload};
use rand::Rng;

/// Picks the next piece to download.
///
/// Tries `draws` uniformly random indices first and falls back to a linear scan. A piece
/// qualifies when it is not verified locally and no other peer is already targeting it.
pub fn select_piece<R: Rng>(
    rng: &mut R,
    local: &Bitfield,
    in_progress: &HashSet<u32>,
    draws: usize,
) -> Option<u32> {
    let num_pieces = local.num_pieces();
    if num_pieces == 0 {
        return None;
    }

    let eligible = |index: usize| !local.has_piece(index) && !in_progress.contains(&(index as u32));

    for _ in 0..draws {
        let index = rng.gen_range(0..num_pieces);
        if eligible(index) {
            return Some(index as u32);
        }
    }

    (0..num_pieces).find(|&i| eligible(i)).map(|i| i as u32)
}

/// Sequential block requests within one target piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCursor {
    pub index: u32,
    pub piece_length: u32,
    pub next_offset: u32,
}

impl RequestCursor {
    pub fn new(index: u32, piece_length: u32) -> Self {
        Self {
            index,
            piece_length,
            next_offset: 0,
        }
    }

    /// Returns the next block request and advances, or `None` once the piece is covered.
    /// The final block is truncated to the piece length.
    pub fn next_request(&mut self, block_size: u32) -> Option<TransferPayload> {
        if self.next_offset >= self.piece_length {
            return None;
        }

        let length = block_size.min(self.piece_length - self.next_offset);
        let request = TransferPayload::new(self.index, self.next_offset, length);
        self.next_offset += length;

        Some(request)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_offset >= self.piece_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_never_selects_verified_or_targeted() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut local = Bitfield::new(6);
        local.set_piece(0);
        local.set_piece(2);
        let in_progress: HashSet<u32> = [1, 3].into_iter().collect();

        for _ in 0..200 {
            let index = select_piece(&mut rng, &local, &in_progress, 5).unwrap();
            assert!(index == 4 || index == 5);
        }
    }

    #[test]
    fn test_linear_scan_when_draws_exhausted() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut local = Bitfield::new(64);
        for i in 0..64 {
            if i != 63 {
                local.set_piece(i);
            }
        }

        assert_eq!(
            select_piece(&mut rng, &local, &HashSet::new(), 0),
            Some(63)
        );
        assert_eq!(
            select_piece(&mut rng, &local, &HashSet::new(), 5),
            Some(63)
        );
    }

    #[test]
    fn test_no_work_left() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut local = Bitfield::new(2);
        local.set_piece(0);
        let in_progress: HashSet<u32> = [1].into_iter().collect();

        assert_eq!(select_piece(&mut rng, &local, &in_progress, 5), None);
        assert_eq!(
            select_piece(&mut rng, &Bitfield::new(0), &HashSet::new(), 5),
            None
        );
    }

    #[test]
    fn test_cursor_walks_piece_in_blocks() {
        let mut cursor = RequestCursor::new(2, 40_000);

        assert_eq!(
            cursor.next_request(16384),
            Some(TransferPayload::new(2, 0, 16384))
        );
        assert_eq!(
            cursor.next_request(16384),
            Some(TransferPayload::new(2, 16384, 16384))
        );
        assert_eq!(
            cursor.next_request(16384),
            Some(TransferPayload::new(2, 32768, 40_000 - 32768))
        );
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.next_request(16384), None);
    }
}
