use std::collections::HashSet;

use protocol::{bitfield::Bitfield, message::TransferPayload};

use super::selection::RequestCursor;

/// Protocol state the dispatch loop keeps for one connected peer.
#[derive(Debug)]
pub struct PeerState {
    /// We are refusing to serve the peer
    pub am_choking: bool,
    /// We want pieces the peer has
    pub am_interested: bool,
    /// The peer is refusing to serve us
    pub peer_choking: bool,
    /// The peer wants pieces we have
    pub peer_interested: bool,
    /// Pieces the peer claims to have
    pub remote: Bitfield,
    /// The piece this peer is downloading for us, if any
    pub cursor: Option<RequestCursor>,
    /// The single block request in flight to this peer
    pub outstanding: Option<TransferPayload>,
}

impl PeerState {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote: Bitfield::new(num_pieces),
            cursor: None,
            outstanding: None,
        }
    }

    pub fn target(&self) -> Option<u32> {
        self.cursor.as_ref().map(|c| c.index)
    }

    /// Drops the target piece and any request in flight. Returns the released index.
    pub fn release_target(&mut self) -> Option<u32> {
        self.outstanding = None;
        self.cursor.take().map(|c| c.index)
    }
}

/// State shared by the whole swarm. Only the dispatch loop mutates it.
#[derive(Debug)]
pub struct SwarmState {
    pub local: Bitfield,
    pub unchoked: usize,
    pub max_unchoked: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Pieces currently targeted by some peer
    pub in_progress: HashSet<u32>,
}

impl SwarmState {
    pub fn new(local: Bitfield, max_unchoked: usize) -> Self {
        Self {
            local,
            unchoked: 0,
            max_unchoked,
            downloaded: 0,
            uploaded: 0,
            in_progress: HashSet::new(),
        }
    }

    /// Takes an unchoke slot if one is free.
    pub fn try_unchoke(&mut self) -> bool {
        if self.unchoked < self.max_unchoked {
            self.unchoked += 1;
            true
        } else {
            false
        }
    }

    pub fn release_unchoke(&mut self) {
        self.unchoked = self.unchoked.saturating_sub(1);
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_complete()
    }

    /// First piece that is neither verified nor targeted by another peer.
    pub fn resume_point(&self) -> Option<u32> {
        (0..self.local.num_pieces())
            .find(|&i| !self.local.has_piece(i) && !self.in_progress.contains(&(i as u32)))
            .map(|i| i as u32)
    }
}
