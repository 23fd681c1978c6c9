use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Display,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use protocol::{
    bitfield::Bitfield,
    error::MessageError,
    message::{Message, MessageId, PiecePayload, TransferPayload},
};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    events::Event,
    peer::{Peer, PeerKey},
    peers::{
        io::IoError,
        link::{LinkConfig, LinkError, PeerLink},
    },
    selection::{select_piece, RequestCursor},
    state::{PeerState, SwarmState},
    stats,
    store::{BlockOutcome, PieceStore, StoreError},
    tracker::{AnnounceEvent, AnnounceRequest, Tracker, DEFAULT_INTERVAL},
};

/// Largest block a peer may request from us.
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub link: LinkConfig,
    pub listen_port: u16,
    pub max_connections: usize,
    pub max_unchoked: usize,
    pub block_size: u32,
    pub random_draws: usize,
}

/// What the dispatch loop should do after handling an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Completed,
    Stopped,
}

/// Totals reported when the orchestrator stops.
#[derive(Debug, PartialEq, Eq)]
pub struct SwarmSummary {
    pub completed: bool,
    pub downloaded: u64,
    pub uploaded: u64,
}

struct PeerEntry {
    link: PeerLink,
    state: PeerState,
}

/// Owns all swarm-wide state and drains the shared event queue on a single task.
///
/// Peer links, connection attempts, tracker announces and timers only ever post events;
/// every mutation of the local bitfield, the unchoke counter, per-peer flags and the
/// output file happens here.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: PieceStore,
    swarm: SwarmState,
    peers: HashMap<Uuid, PeerEntry>,
    /// Peers queued, connecting or connected
    known: HashSet<PeerKey>,
    /// Peers that violated the protocol this session
    banned: HashSet<PeerKey>,
    pending: VecDeque<Peer>,
    connecting: usize,
    ever_established: bool,
    interval: Duration,
    tracker: Arc<dyn Tracker>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    reannounce: Option<JoinHandle<()>>,
    stats_path: Option<PathBuf>,
    rng: StdRng,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: PieceStore,
        local: Bitfield,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut swarm = SwarmState::new(local, config.max_unchoked);
        swarm.downloaded = verified_bytes(&store, &swarm.local);

        Self {
            config,
            store,
            swarm,
            peers: HashMap::new(),
            known: HashSet::new(),
            banned: HashSet::new(),
            pending: VecDeque::new(),
            connecting: 0,
            ever_established: false,
            interval: DEFAULT_INTERVAL,
            tracker,
            event_tx,
            event_rx,
            reannounce: None,
            stats_path: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Persists the uploaded counter to `path` on shutdown, starting from `uploaded`.
    pub fn with_stats(mut self, path: PathBuf, uploaded: u64) -> Self {
        self.stats_path = Some(path);
        self.swarm.uploaded = uploaded;
        self
    }

    /// Sender for components outside the loop (listener, signal handler).
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.event_tx.clone()
    }

    /// Bytes still missing from the destination file.
    pub fn left(&self) -> u64 {
        self.store.total_length() - verified_bytes(&self.store, &self.swarm.local)
    }

    /// Runs the dispatch loop until the download completes or a shutdown is requested.
    ///
    /// Finishing sends exactly one final announce: `completed` or `stopped`.
    pub async fn run(
        mut self,
        initial_peers: Vec<Peer>,
        interval: Duration,
    ) -> Result<SwarmSummary, SwarmError> {
        self.merge_peers(initial_peers);
        self.connect_pending();
        self.schedule_reannounce(interval);

        let flow = loop {
            let Some(event) = self.event_rx.recv().await else {
                break Flow::Stopped;
            };
            match self.handle_event(event) {
                Ok(Flow::Continue) => {}
                Ok(flow) => break flow,
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            }
        };

        self.teardown();

        let completed = flow == Flow::Completed;
        let final_event = if completed {
            info!("Download complete");
            AnnounceEvent::Completed
        } else {
            info!("Stopping");
            AnnounceEvent::Stopped
        };
        if let Err(e) = self.tracker.announce(self.announce_request(final_event)).await {
            warn!(error = %e, "Final announce failed");
        }

        Ok(SwarmSummary {
            completed,
            downloaded: self.swarm.downloaded,
            uploaded: self.swarm.uploaded,
        })
    }

    pub fn handle_event(&mut self, event: Event) -> Result<Flow, SwarmError> {
        match event {
            Event::PeerEstablished { link } => {
                self.connecting = self.connecting.saturating_sub(1);
                self.register_link(link);
            }
            Event::PeerAccepted { link } => self.register_link(link),
            Event::PeerConnectFailed { peer, error } => {
                self.connecting = self.connecting.saturating_sub(1);
                debug!(peer_addr = %peer, error = %error, "Connection attempt failed");
                self.forget_peer(&peer, &error);
                self.connect_pending();

                if !self.ever_established
                    && self.peers.is_empty()
                    && self.connecting == 0
                    && self.pending.is_empty()
                {
                    return Err(SwarmError::NoPeersReachable);
                }
            }
            Event::PeerClosed { session_id, error } => {
                self.close_peer(session_id, Some(&error));
                self.connect_pending();
            }
            Event::PeerMessage {
                session_id,
                message,
            } => return Ok(self.handle_message(session_id, message)),
            Event::TrackerPeers { peers, interval } => {
                debug!(peer_count = peers.len(), "Tracker returned peers");
                self.merge_peers(peers);
                self.connect_pending();
                self.schedule_reannounce(interval);
            }
            Event::TrackerFailed { error } => {
                warn!(error = %error, "Announce failed, retrying at next interval");
                self.schedule_reannounce(self.interval);
            }
            Event::ReannounceDue => self.spawn_announce(AnnounceEvent::None),
            Event::Shutdown => return Ok(Flow::Stopped),
        }

        Ok(Flow::Continue)
    }

    /// Adds an established link to the active set.
    fn register_link(&mut self, mut link: PeerLink) {
        let peer = link.peer().clone();
        if self.is_banned(&peer) {
            debug!(peer_addr = %peer, "Dropping banned peer");
            link.disconnect();
            return;
        }
        if peer.peer_id == Some(self.config.link.local_peer_id) {
            link.disconnect();
            self.release_keys(&peer);
            return;
        }
        if self.is_connected(&peer) {
            debug!(peer_addr = %peer, "Already connected to peer, dropping duplicate link");
            link.disconnect();
            self.release_keys(&peer);
            return;
        }
        if self.peers.len() >= self.config.max_connections {
            debug!(peer_addr = %peer, "Connection limit reached, dropping link");
            link.disconnect();
            self.release_keys(&peer);
            return;
        }

        self.known.extend(peer.keys());
        self.ever_established = true;

        let mut state = PeerState::new(self.store.num_pieces());
        if self.swarm.try_unchoke() {
            state.am_choking = false;
            send(&link, Message::Unchoke);
        }
        if !self.swarm.local.is_empty() {
            send(
                &link,
                Message::Bitfield {
                    bits: self.swarm.local.as_bytes().to_vec(),
                },
            );
        }
        if let Some(index) = self.swarm.resume_point() {
            self.claim(&mut state, index);
        }

        info!(
            session_id = %link.session_id(),
            peer_addr = %link.peer(),
            unchoked = !state.am_choking,
            target = ?state.target(),
            "Peer registered"
        );
        self.peers.insert(link.session_id(), PeerEntry { link, state });
    }

    fn handle_message(&mut self, session_id: Uuid, message: Message) -> Flow {
        let Some(entry) = self.peers.get_mut(&session_id) else {
            return Flow::Continue;
        };

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                entry.state.peer_choking = true;
                if let Some(index) = entry.state.release_target() {
                    self.swarm.in_progress.remove(&index);
                    self.store.discard(index);
                }
            }
            Message::Unchoke => {
                entry.state.peer_choking = false;
                if entry.state.am_interested {
                    self.request_next_block(session_id);
                }
            }
            Message::Interested => {
                entry.state.peer_interested = true;
                if !entry.state.am_choking {
                    send(&entry.link, Message::Unchoke);
                } else if self.swarm.try_unchoke() {
                    entry.state.am_choking = false;
                    send(&entry.link, Message::Unchoke);
                }
            }
            Message::NotInterested => entry.state.peer_interested = false,
            Message::Have { index } => {
                entry.state.remote.set_piece(index as usize);
                self.update_interest(session_id);
            }
            Message::Bitfield { bits } => {
                entry.state.remote = Bitfield::from_bytes(&bits, self.store.num_pieces());
                self.update_interest(session_id);
            }
            Message::Request(request) => self.serve_request(session_id, request),
            Message::Piece(payload) => return self.handle_piece(session_id, payload),
        }

        Flow::Continue
    }

    /// Sends Interested the first time the peer advertises a piece we lack.
    fn update_interest(&mut self, session_id: Uuid) {
        let Some(entry) = self.peers.get_mut(&session_id) else {
            return;
        };
        if entry.state.am_interested || !entry.state.remote.has_piece_missing_from(&self.swarm.local)
        {
            return;
        }

        entry.state.am_interested = true;
        send(&entry.link, Message::Interested);
        if !entry.state.peer_choking {
            self.request_next_block(session_id);
        }
    }

    fn handle_piece(&mut self, session_id: Uuid, payload: PiecePayload) -> Flow {
        let Some(entry) = self.peers.get_mut(&session_id) else {
            return Flow::Continue;
        };

        let PiecePayload {
            index,
            begin,
            block,
        } = payload;
        let Some(requested_length) = entry
            .state
            .outstanding
            .as_ref()
            .filter(|r| r.index == index && r.begin == begin)
            .map(|r| r.length)
        else {
            debug!(%session_id, piece_index = index, begin, "Ignoring unrequested block");
            return Flow::Continue;
        };
        if self.swarm.local.has_piece(index as usize) {
            debug!(%session_id, piece_index = index, "Ignoring block for verified piece");
            return Flow::Continue;
        }
        if requested_length as usize != block.len() {
            warn!(
                %session_id,
                piece_index = index,
                begin,
                requested = requested_length,
                received = block.len(),
                "Block length does not match request"
            );
            let error = LinkError::Io(IoError::Message(MessageError::InvalidLength {
                message_id: MessageId::Piece as u8,
                length: block.len(),
            }));
            self.close_peer(session_id, Some(&error));
            self.connect_pending();
            return Flow::Continue;
        }
        entry.state.outstanding = None;

        match self.store.accept_block(index, begin, &block) {
            Ok(BlockOutcome::Pending { .. }) => {}
            Ok(BlockOutcome::Verified { length }) => {
                entry.state.cursor = None;
                self.swarm.in_progress.remove(&index);
                self.swarm.local.set_piece(index as usize);
                self.swarm.downloaded += length as u64;
                info!(
                    piece_index = index,
                    verified = self.swarm.local.count(),
                    total = self.store.num_pieces(),
                    "Piece verified"
                );

                self.broadcast_have(index);
                if self.swarm.is_complete() {
                    return Flow::Completed;
                }
            }
            Ok(BlockOutcome::Corrupted) => {
                entry.state.cursor = None;
                self.swarm.in_progress.remove(&index);
            }
            Err(e) => {
                entry.state.release_target();
                self.swarm.in_progress.remove(&index);
                self.store.discard(index);
                if matches!(e, StoreError::Io(_)) {
                    error!(piece_index = index, error = %e, "Failed to write piece");
                } else {
                    warn!(%session_id, error = %e, "Rejected block");
                }
            }
        }

        let peer_choking = self
            .peers
            .get(&session_id)
            .map_or(true, |entry| entry.state.peer_choking);
        if !peer_choking {
            self.request_next_block(session_id);
        }

        Flow::Continue
    }

    /// Issues the next block request to a peer that is unchoking us.
    ///
    /// Keeps at most one request outstanding per peer and selects a new target piece when
    /// the current one is done.
    fn request_next_block(&mut self, session_id: Uuid) {
        let Some(entry) = self.peers.get_mut(&session_id) else {
            return;
        };
        let state = &mut entry.state;
        if state.peer_choking || !state.am_interested || state.outstanding.is_some() {
            return;
        }

        if state.cursor.as_ref().is_some_and(|c| c.is_exhausted()) {
            if let Some(index) = state.release_target() {
                self.swarm.in_progress.remove(&index);
                self.store.discard(index);
            }
        }

        if state.cursor.is_none() {
            let Some(index) = select_piece(
                &mut self.rng,
                &self.swarm.local,
                &self.swarm.in_progress,
                self.config.random_draws,
            ) else {
                debug!(%session_id, "No piece left to request");
                return;
            };
            let length = self.store.piece(index).map_or(0, |p| p.length);
            self.swarm.in_progress.insert(index);
            state.cursor = Some(RequestCursor::new(index, length));
        }

        let Some(request) = state
            .cursor
            .as_mut()
            .and_then(|cursor| cursor.next_request(self.config.block_size))
        else {
            return;
        };

        state.outstanding = Some(request.clone());
        send(&entry.link, Message::Request(request));
    }

    fn serve_request(&mut self, session_id: Uuid, request: TransferPayload) {
        let Some(entry) = self.peers.get_mut(&session_id) else {
            return;
        };
        if entry.state.am_choking
            || !self.swarm.local.has_piece(request.index as usize)
            || request.length == 0
            || request.length > MAX_REQUEST_LENGTH
        {
            debug!(%session_id, ?request, "Ignoring request");
            return;
        }

        match self
            .store
            .read_range(request.index, request.begin, request.length)
        {
            Ok(block) => {
                self.swarm.uploaded += block.len() as u64;
                send(
                    &entry.link,
                    Message::Piece(PiecePayload::new(request.index, request.begin, block)),
                );
            }
            Err(e) => warn!(%session_id, error = %e, "Failed to serve request"),
        }
    }

    fn broadcast_have(&self, index: u32) {
        for entry in self.peers.values() {
            send(&entry.link, Message::Have { index });
        }
    }

    fn claim(&mut self, state: &mut PeerState, index: u32) {
        let length = self.store.piece(index).map_or(0, |p| p.length);
        self.swarm.in_progress.insert(index);
        state.cursor = Some(RequestCursor::new(index, length));
    }

    /// Removes a peer from the active set and returns its slot and target piece.
    fn close_peer(&mut self, session_id: Uuid, error: Option<&LinkError>) {
        let Some(mut entry) = self.peers.remove(&session_id) else {
            return;
        };

        if entry.link.disconnect() && !entry.state.am_choking {
            self.swarm.release_unchoke();
        }
        if let Some(index) = entry.state.release_target() {
            self.swarm.in_progress.remove(&index);
            self.store.discard(index);
        }

        let peer = entry.link.peer().clone();
        match error {
            Some(error) => {
                info!(%session_id, peer_addr = %peer, error = %error, "Peer closed");
                self.forget_peer(&peer, error);
            }
            None => self.release_keys(&peer),
        }
    }

    /// Protocol violators are banned; everyone else may be rediscovered by the tracker.
    fn forget_peer(&mut self, peer: &Peer, error: &LinkError) {
        self.release_keys(peer);
        if error.is_protocol() {
            self.banned.extend(peer.keys());
        }
    }

    /// Drops the peer's keys from `known`, except those still held by an active link.
    fn release_keys(&mut self, peer: &Peer) {
        for key in peer.keys() {
            if !self.is_active_key(&key) {
                self.known.remove(&key);
            }
        }
    }

    fn is_active_key(&self, key: &PeerKey) -> bool {
        self.peers
            .values()
            .any(|entry| entry.link.peer().keys().contains(key))
    }

    fn is_connected(&self, peer: &Peer) -> bool {
        peer.peer_id.is_some()
            && self
                .peers
                .values()
                .any(|entry| entry.link.peer().peer_id == peer.peer_id)
    }

    fn is_banned(&self, peer: &Peer) -> bool {
        peer.keys().iter().any(|key| self.banned.contains(key))
    }

    /// Queues peers we have not seen before.
    fn merge_peers(&mut self, peers: Vec<Peer>) {
        for peer in peers {
            if peer.peer_id == Some(self.config.link.local_peer_id) || self.is_banned(&peer) {
                continue;
            }
            let keys = peer.keys();
            if keys.iter().any(|key| self.known.contains(key)) {
                continue;
            }
            self.known.extend(keys);
            self.pending.push_back(peer);
        }
    }

    /// Starts connection attempts while there is room under `max_connections`.
    fn connect_pending(&mut self) {
        while self.peers.len() + self.connecting < self.config.max_connections {
            let Some(peer) = self.pending.pop_front() else {
                break;
            };

            self.connecting += 1;
            let config = self.config.link.clone();
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                let event = match PeerLink::connect(peer.clone(), &config, event_tx.clone()).await
                {
                    Ok(link) => Event::PeerEstablished { link },
                    Err(error) => Event::PeerConnectFailed { peer, error },
                };
                let _ = event_tx.send(event);
            });
        }
    }

    /// Posts `ReannounceDue` after `interval`, replacing any earlier timer.
    fn schedule_reannounce(&mut self, interval: Duration) {
        self.interval = interval;
        if let Some(handle) = self.reannounce.take() {
            handle.abort();
        }

        let event_tx = self.event_tx.clone();
        self.reannounce = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = event_tx.send(Event::ReannounceDue);
        }));
    }

    fn spawn_announce(&self, event: AnnounceEvent) {
        let request = self.announce_request(event);
        let tracker = Arc::clone(&self.tracker);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let event = match tracker.announce(request).await {
                Ok(response) => Event::TrackerPeers {
                    peers: response.peers,
                    interval: response.interval,
                },
                Err(error) => Event::TrackerFailed { error },
            };
            let _ = event_tx.send(event);
        });
    }

    pub fn announce_request(&self, event: AnnounceEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.config.link.info_hash,
            peer_id: self.config.link.local_peer_id,
            port: self.config.listen_port,
            uploaded: self.swarm.uploaded,
            downloaded: self.swarm.downloaded,
            left: self.left(),
            event,
        }
    }

    /// Closes every link, stops the reannounce timer and saves the upload counter.
    fn teardown(&mut self) {
        if let Some(handle) = self.reannounce.take() {
            handle.abort();
        }

        let session_ids: Vec<Uuid> = self.peers.keys().copied().collect();
        for session_id in session_ids {
            self.close_peer(session_id, None);
        }

        if let Some(path) = &self.stats_path {
            if let Err(e) = stats::save_uploaded(path, self.swarm.uploaded) {
                warn!(path = %path.display(), error = %e, "Failed to save upload stats");
            }
        }
    }
}

fn send(link: &PeerLink, message: Message) {
    if let Err(e) = link.send_message(message) {
        debug!(session_id = %link.session_id(), error = %e, "Dropping outbound message");
    }
}

fn verified_bytes(store: &PieceStore, local: &Bitfield) -> u64 {
    (0..store.num_pieces())
        .filter(|&i| local.has_piece(i))
        .filter_map(|i| store.piece(i as u32))
        .map(|p| p.length as u64)
        .sum()
}

#[derive(Debug)]
pub enum SwarmError {
    /// Every candidate peer failed before any connection was established
    NoPeersReachable,
}

impl Display for SwarmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmError::NoPeersReachable => write!(f, "Could not connect to any peer"),
        }
    }
}

impl std::error::Error for SwarmError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{
        metainfo::{tests::sha1, PieceDescriptor},
        peer::Ip,
        peers::{
            io::{read_message, write_message},
            link::tests::{link_config, test_peer},
        },
        tracker::tests::RecordingTracker,
    };
    use assert_matches::assert_matches;
    use protocol::error::HandshakeError;
    use std::fs;
    use tempfile::{tempdir, TempDir};
    use tokio::{
        io::{duplex, DuplexStream},
        time::Instant,
    };

    const PIECE: usize = 32768;
    const BLOCK: u32 = 16384;

    struct Harness {
        orchestrator: Orchestrator,
        tracker: Arc<RecordingTracker>,
        content: Vec<u8>,
        dir: TempDir,
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    fn harness(content: Vec<u8>, max_unchoked: usize) -> Harness {
        harness_with(content, max_unchoked, RecordingTracker::default())
    }

    fn harness_with(content: Vec<u8>, max_unchoked: usize, tracker: RecordingTracker) -> Harness {
        let dir = tempdir().unwrap();
        let descriptors: Vec<PieceDescriptor> = content
            .chunks(PIECE)
            .enumerate()
            .map(|(index, chunk)| PieceDescriptor {
                index: index as u32,
                length: chunk.len() as u32,
                hash: sha1(chunk),
            })
            .collect();
        let num_pieces = descriptors.len();
        let store = PieceStore::open(dir.path().join("out.bin"), PIECE as u64, descriptors).unwrap();

        let tracker = Arc::new(tracker);
        let config = OrchestratorConfig {
            link: link_config([1u8; 20]),
            listen_port: 6881,
            max_connections: 8,
            max_unchoked,
            block_size: BLOCK,
            random_draws: 5,
        };
        let orchestrator = Orchestrator::new(
            config,
            store,
            Bitfield::new(num_pieces),
            tracker.clone(),
        );

        Harness {
            orchestrator,
            tracker,
            content,
            dir,
        }
    }

    /// Registers an inbound link whose far end is returned to the test.
    fn connect_peer(orchestrator: &mut Orchestrator, port: u16) -> (Uuid, DuplexStream) {
        register(orchestrator, test_peer(port), |link| Event::PeerAccepted { link })
    }

    fn register(
        orchestrator: &mut Orchestrator,
        peer: Peer,
        event: impl FnOnce(PeerLink) -> Event,
    ) -> (Uuid, DuplexStream) {
        let (local, remote) = duplex(256 * 1024);
        let link = PeerLink::establish(
            local,
            peer,
            &orchestrator.config.link,
            orchestrator.event_sender(),
        );
        let session_id = link.session_id();
        orchestrator.handle_event(event(link)).unwrap();
        (session_id, remote)
    }

    async fn deliver(
        orchestrator: &mut Orchestrator,
        remote: &mut DuplexStream,
        message: Message,
    ) -> Flow {
        write_message(remote, &message).await.unwrap();
        let event = orchestrator.event_rx.recv().await.unwrap();
        orchestrator.handle_event(event).unwrap()
    }

    fn full_bitfield(num_pieces: usize) -> Message {
        let mut bits = Bitfield::new(num_pieces);
        for i in 0..num_pieces {
            bits.set_piece(i);
        }
        Message::Bitfield {
            bits: bits.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_unchoke_bound_on_registration() {
        let mut h = harness(content(PIECE), 1);

        let (first, mut first_remote) = connect_peer(&mut h.orchestrator, 1);
        let (second, _second_remote) = connect_peer(&mut h.orchestrator, 2);

        assert_eq!(read_message(&mut first_remote).await.unwrap(), Message::Unchoke);
        assert!(!h.orchestrator.peers[&first].state.am_choking);
        assert!(h.orchestrator.peers[&second].state.am_choking);
        assert_eq!(h.orchestrator.swarm.unchoked, 1);
    }

    #[tokio::test]
    async fn test_interested_waits_for_free_slot() {
        let mut h = harness(content(PIECE), 1);

        let (first, _first_remote) = connect_peer(&mut h.orchestrator, 1);
        let (second, mut second_remote) = connect_peer(&mut h.orchestrator, 2);

        deliver(&mut h.orchestrator, &mut second_remote, Message::Interested).await;
        assert!(h.orchestrator.peers[&second].state.peer_interested);
        assert!(h.orchestrator.peers[&second].state.am_choking);
        assert_eq!(h.orchestrator.swarm.unchoked, 1);

        h.orchestrator
            .handle_event(Event::PeerClosed {
                session_id: first,
                error: LinkError::Closed,
            })
            .unwrap();
        assert_eq!(h.orchestrator.swarm.unchoked, 0);

        deliver(&mut h.orchestrator, &mut second_remote, Message::Interested).await;
        assert!(!h.orchestrator.peers[&second].state.am_choking);
        assert_eq!(h.orchestrator.swarm.unchoked, 1);
        assert_eq!(read_message(&mut second_remote).await.unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn test_registration_targets_resume_point() {
        let mut h = harness(content(3 * PIECE), 4);

        let (first, _r1) = connect_peer(&mut h.orchestrator, 1);
        let (second, _r2) = connect_peer(&mut h.orchestrator, 2);

        assert_eq!(h.orchestrator.peers[&first].state.target(), Some(0));
        assert_eq!(h.orchestrator.peers[&second].state.target(), Some(1));
        assert_eq!(h.orchestrator.swarm.in_progress.len(), 2);
    }

    #[tokio::test]
    async fn test_blocks_requested_in_order_and_piece_written() {
        let mut h = harness(content(2 * PIECE), 4);
        let (session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Unchoke);

        deliver(&mut h.orchestrator, &mut remote, full_bitfield(2)).await;
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Interested);

        deliver(&mut h.orchestrator, &mut remote, Message::Unchoke).await;
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, 0, BLOCK))
        );

        let block = h.content[..BLOCK as usize].to_vec();
        deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, block)),
        )
        .await;
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, BLOCK, BLOCK))
        );

        let block = h.content[BLOCK as usize..PIECE].to_vec();
        let flow = deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, BLOCK, block)),
        )
        .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Have { index: 0 });
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(1, 0, BLOCK))
        );

        assert!(h.orchestrator.swarm.local.has_piece(0));
        assert_eq!(h.orchestrator.swarm.downloaded, PIECE as u64);
        assert_eq!(h.orchestrator.peers[&session_id].state.target(), Some(1));

        let on_disk = fs::read(h.dir.path().join("out.bin")).unwrap();
        assert_eq!(&on_disk[..PIECE], &h.content[..PIECE]);
    }

    #[tokio::test]
    async fn test_choke_releases_target() {
        let mut h = harness(content(PIECE), 4);
        let (session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);

        deliver(&mut h.orchestrator, &mut remote, full_bitfield(1)).await;
        deliver(&mut h.orchestrator, &mut remote, Message::Unchoke).await;
        let block = h.content[..BLOCK as usize].to_vec();
        deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, block)),
        )
        .await;
        assert!(h.orchestrator.store.is_buffered(0));

        deliver(&mut h.orchestrator, &mut remote, Message::Choke).await;
        let state = &h.orchestrator.peers[&session_id].state;
        assert!(state.peer_choking);
        assert_eq!(state.target(), None);
        assert!(state.outstanding.is_none());
        assert!(h.orchestrator.swarm.in_progress.is_empty());
        assert!(!h.orchestrator.store.is_buffered(0));
    }

    #[tokio::test]
    async fn test_corrupted_piece_is_requested_again() {
        let mut h = harness(content(BLOCK as usize), 4);
        let (_session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Unchoke);

        deliver(&mut h.orchestrator, &mut remote, full_bitfield(1)).await;
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Interested);
        deliver(&mut h.orchestrator, &mut remote, Message::Unchoke).await;
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, 0, BLOCK))
        );

        let flow = deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, vec![0xEE; BLOCK as usize])),
        )
        .await;
        assert_eq!(flow, Flow::Continue);
        assert!(!h.orchestrator.swarm.local.has_piece(0));
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, 0, BLOCK))
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_swarm_running() {
        let mut h = harness(content(BLOCK as usize), 4);
        h.orchestrator.store.reopen_read_only().unwrap();
        let (session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Unchoke);

        deliver(&mut h.orchestrator, &mut remote, full_bitfield(1)).await;
        assert_eq!(read_message(&mut remote).await.unwrap(), Message::Interested);
        deliver(&mut h.orchestrator, &mut remote, Message::Unchoke).await;
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, 0, BLOCK))
        );

        let block = h.content.clone();
        let flow = deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, block)),
        )
        .await;

        assert_eq!(flow, Flow::Continue);
        assert!(!h.orchestrator.swarm.local.has_piece(0));
        assert_eq!(h.orchestrator.swarm.downloaded, 0);
        assert!(h.orchestrator.peers.contains_key(&session_id));
        assert_eq!(
            read_message(&mut remote).await.unwrap(),
            Message::Request(TransferPayload::new(0, 0, BLOCK))
        );
    }

    #[tokio::test]
    async fn test_block_length_mismatch_closes_peer() {
        let mut h = harness(content(PIECE), 4);
        let (session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);

        deliver(&mut h.orchestrator, &mut remote, full_bitfield(1)).await;
        deliver(&mut h.orchestrator, &mut remote, Message::Unchoke).await;
        assert_eq!(
            h.orchestrator.peers[&session_id].state.outstanding,
            Some(TransferPayload::new(0, 0, BLOCK))
        );

        let flow = deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, vec![1u8; 100])),
        )
        .await;

        assert_eq!(flow, Flow::Continue);
        assert!(!h.orchestrator.peers.contains_key(&session_id));
        assert!(h.orchestrator.swarm.in_progress.is_empty());
        assert!(!h.orchestrator.store.is_buffered(0));
        assert_eq!(h.orchestrator.swarm.unchoked, 0);
        assert!(h
            .orchestrator
            .banned
            .contains(&PeerKey::Address("127.0.0.1:1".to_string())));
    }

    #[tokio::test]
    async fn test_closed_peer_can_be_offered_again() {
        let mut h = harness(content(PIECE), 4);
        let queued = Peer::new(None, Ip::from("127.0.0.1"), 7000);
        h.orchestrator.merge_peers(vec![queued.clone()]);
        h.orchestrator.pending.clear();
        h.orchestrator.connecting = 1;

        let handshaken = Peer {
            peer_id: Some([5u8; 20]),
            ..queued.clone()
        };
        let (session_id, _remote) = register(&mut h.orchestrator, handshaken, |link| {
            Event::PeerEstablished { link }
        });
        assert_eq!(h.orchestrator.connecting, 0);

        h.orchestrator
            .handle_event(Event::PeerClosed {
                session_id,
                error: LinkError::Closed,
            })
            .unwrap();
        assert!(h.orchestrator.known.is_empty());

        h.orchestrator.merge_peers(vec![queued]);
        assert_eq!(h.orchestrator.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_close_bans_every_key() {
        let mut h = harness(content(PIECE), 4);
        let handshaken = Peer::new(Some([5u8; 20]), Ip::from("127.0.0.1"), 7000);
        let (session_id, _remote) = register(&mut h.orchestrator, handshaken, |link| {
            Event::PeerEstablished { link }
        });

        h.orchestrator
            .handle_event(Event::PeerClosed {
                session_id,
                error: LinkError::Io(IoError::Message(MessageError::InvalidMessageId(42))),
            })
            .unwrap();

        h.orchestrator.merge_peers(vec![
            Peer::new(None, Ip::from("127.0.0.1"), 7000),
            Peer::new(Some([5u8; 20]), Ip::from("10.0.0.8"), 6881),
        ]);
        assert!(h.orchestrator.pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_peer_id_is_dropped() {
        let mut h = harness(content(PIECE), 4);
        let outbound = Peer::new(Some([4u8; 20]), Ip::from("127.0.0.1"), 6881);
        let inbound = Peer::new(Some([4u8; 20]), Ip::from("127.0.0.1"), 51000);

        let (first, _first_remote) = register(&mut h.orchestrator, outbound, |link| {
            Event::PeerEstablished { link }
        });
        let (second, _second_remote) =
            register(&mut h.orchestrator, inbound, |link| Event::PeerAccepted { link });

        assert!(h.orchestrator.peers.contains_key(&first));
        assert!(!h.orchestrator.peers.contains_key(&second));
        assert_eq!(h.orchestrator.peers.len(), 1);
        assert_eq!(h.orchestrator.swarm.unchoked, 1);
        assert!(h.orchestrator.known.contains(&PeerKey::Id([4u8; 20])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannounce_merges_peers_and_reschedules() {
        let a = Peer::new(None, Ip::from("10.0.0.2"), 6881);
        let b = Peer::new(Some([6u8; 20]), Ip::from("10.0.0.3"), 6881);
        let tracker = RecordingTracker {
            peers: vec![a.clone(), b, a],
            interval: Some(Duration::from_secs(300)),
            ..Default::default()
        };
        let mut h = harness_with(content(PIECE), 4, tracker);
        h.orchestrator.config.max_connections = 0;
        h.orchestrator.schedule_reannounce(Duration::from_secs(30));

        for (cycle, wait) in [(1, 30), (2, 300)] {
            let start = Instant::now();
            let event = h.orchestrator.event_rx.recv().await.unwrap();
            assert_matches!(event, Event::ReannounceDue);
            assert!(start.elapsed() >= Duration::from_secs(wait));
            h.orchestrator.handle_event(event).unwrap();

            let event = h.orchestrator.event_rx.recv().await.unwrap();
            assert_matches!(
                &event,
                Event::TrackerPeers { peers, interval }
                    if peers.len() == 3 && *interval == Duration::from_secs(300)
            );
            h.orchestrator.handle_event(event).unwrap();

            assert_eq!(h.tracker.events(), vec![AnnounceEvent::None; cycle]);
            assert_eq!(h.orchestrator.pending.len(), 2);
            assert_eq!(h.orchestrator.interval, Duration::from_secs(300));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reannounce_retries_at_previous_interval() {
        let tracker = RecordingTracker {
            fail: true,
            ..Default::default()
        };
        let mut h = harness_with(content(PIECE), 4, tracker);
        h.orchestrator.schedule_reannounce(Duration::from_secs(30));

        let event = h.orchestrator.event_rx.recv().await.unwrap();
        assert_matches!(event, Event::ReannounceDue);
        h.orchestrator.handle_event(event).unwrap();

        let event = h.orchestrator.event_rx.recv().await.unwrap();
        assert_matches!(event, Event::TrackerFailed { .. });
        assert_eq!(h.orchestrator.handle_event(event).unwrap(), Flow::Continue);

        let start = Instant::now();
        let event = h.orchestrator.event_rx.recv().await.unwrap();
        assert_matches!(event, Event::ReannounceDue);
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.tracker.events(), vec![AnnounceEvent::None]);
    }

    #[tokio::test]
    async fn test_unrequested_block_is_ignored() {
        let mut h = harness(content(PIECE), 4);
        let (_session_id, mut remote) = connect_peer(&mut h.orchestrator, 1);

        let block = h.content[..BLOCK as usize].to_vec();
        deliver(
            &mut h.orchestrator,
            &mut remote,
            Message::Piece(PiecePayload::new(0, 0, block)),
        )
        .await;
        assert!(!h.orchestrator.store.is_buffered(0));
    }

    #[tokio::test]
    async fn test_requests_served_only_when_unchoked() {
        let mut h = harness(content(PIECE), 1);
        fs::write(h.dir.path().join("out.bin"), &h.content).unwrap();
        h.orchestrator.swarm.local.set_piece(0);

        let (_first, mut first_remote) = connect_peer(&mut h.orchestrator, 1);
        let (_second, mut second_remote) = connect_peer(&mut h.orchestrator, 2);
        assert_eq!(read_message(&mut first_remote).await.unwrap(), Message::Unchoke);
        assert_matches!(
            read_message(&mut first_remote).await.unwrap(),
            Message::Bitfield { .. }
        );
        assert_matches!(
            read_message(&mut second_remote).await.unwrap(),
            Message::Bitfield { .. }
        );

        let request = Message::Request(TransferPayload::new(0, 100, 1000));
        deliver(&mut h.orchestrator, &mut second_remote, request.clone()).await;
        assert_eq!(h.orchestrator.swarm.uploaded, 0);

        deliver(&mut h.orchestrator, &mut first_remote, request).await;
        assert_eq!(
            read_message(&mut first_remote).await.unwrap(),
            Message::Piece(PiecePayload::new(0, 100, h.content[100..1100].to_vec()))
        );
        assert_eq!(h.orchestrator.swarm.uploaded, 1000);
    }

    #[tokio::test]
    async fn test_protocol_failure_bans_peer() {
        let mut h = harness(content(PIECE), 4);
        let peer = Peer::new(Some([9u8; 20]), Ip::from("10.0.0.9"), 6881);
        h.orchestrator.merge_peers(vec![peer.clone()]);
        h.orchestrator.pending.clear();
        h.orchestrator.connecting = 1;
        h.orchestrator.ever_established = true;

        h.orchestrator
            .handle_event(Event::PeerConnectFailed {
                peer: peer.clone(),
                error: LinkError::Handshake(HandshakeError::InfoHashMismatch),
            })
            .unwrap();

        h.orchestrator.merge_peers(vec![peer]);
        assert!(h.orchestrator.pending.is_empty());
        assert!(h.orchestrator.banned.contains(&PeerKey::Id([9u8; 20])));
    }

    #[tokio::test]
    async fn test_merge_skips_known_and_self() {
        let mut h = harness(content(PIECE), 4);
        let local_id = h.orchestrator.config.link.local_peer_id;

        h.orchestrator.merge_peers(vec![
            Peer::new(Some([2u8; 20]), Ip::from("10.0.0.2"), 1),
            Peer::new(Some([2u8; 20]), Ip::from("10.0.0.3"), 1),
            Peer::new(None, Ip::from("10.0.0.4"), 1),
            Peer::new(None, Ip::from("10.0.0.4"), 1),
            Peer::new(Some(local_id), Ip::from("10.0.0.5"), 1),
        ]);

        assert_eq!(h.orchestrator.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_all_candidates_failing_is_fatal() {
        let mut h = harness(content(PIECE), 4);
        let peer = Peer::new(None, Ip::from("10.0.0.2"), 1);
        h.orchestrator.merge_peers(vec![peer.clone()]);
        h.orchestrator.pending.clear();
        h.orchestrator.connecting = 1;

        assert_matches!(
            h.orchestrator.handle_event(Event::PeerConnectFailed {
                peer,
                error: LinkError::Closed,
            }),
            Err(SwarmError::NoPeersReachable)
        );
    }

    #[tokio::test]
    async fn test_run_completes_and_announces_once() {
        let h = harness(content(PIECE + 1000), 4);
        let Harness {
            orchestrator,
            tracker,
            content,
            dir,
        } = h;

        let (local, mut remote) = duplex(256 * 1024);
        let link = PeerLink::establish(
            local,
            test_peer(1),
            &orchestrator.config.link,
            orchestrator.event_sender(),
        );
        orchestrator
            .event_sender()
            .send(Event::PeerAccepted { link })
            .unwrap();

        let seed = content.clone();
        let seeder = tokio::spawn(async move {
            write_message(&mut remote, &full_bitfield(2)).await.unwrap();
            let mut haves = Vec::new();
            while let Ok(message) = read_message(&mut remote).await {
                match message {
                    Message::Interested => {
                        write_message(&mut remote, &Message::Unchoke).await.unwrap()
                    }
                    Message::Request(r) => {
                        let start = r.index as usize * PIECE + r.begin as usize;
                        let block = seed[start..start + r.length as usize].to_vec();
                        write_message(
                            &mut remote,
                            &Message::Piece(PiecePayload::new(r.index, r.begin, block)),
                        )
                        .await
                        .unwrap();
                    }
                    Message::Have { index } => haves.push(index),
                    _ => {}
                }
            }
            haves
        });

        let summary = orchestrator.run(Vec::new(), DEFAULT_INTERVAL).await.unwrap();
        assert_eq!(
            summary,
            SwarmSummary {
                completed: true,
                downloaded: (PIECE + 1000) as u64,
                uploaded: 0,
            }
        );
        assert_eq!(tracker.events(), vec![AnnounceEvent::Completed]);

        let mut haves = seeder.await.unwrap();
        haves.sort();
        assert_eq!(haves, vec![0, 1]);
        assert_eq!(fs::read(dir.path().join("out.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_shutdown_announces_stopped_and_saves_stats() {
        let h = harness(content(PIECE), 4);
        let stats_path = h.dir.path().join("out.bin.stats");
        let orchestrator = h.orchestrator.with_stats(stats_path.clone(), 42);

        orchestrator.event_sender().send(Event::Shutdown).unwrap();
        let summary = orchestrator.run(Vec::new(), DEFAULT_INTERVAL).await.unwrap();

        assert!(!summary.completed);
        assert_eq!(h.tracker.events(), vec![AnnounceEvent::Stopped]);
        assert_eq!(stats::load_uploaded(&stats_path), 42);
    }
}
