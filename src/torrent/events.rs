use std::time::Duration;

use protocol::message::Message;
use uuid::Uuid;

use super::{
    peer::Peer,
    peers::link::{LinkError, PeerLink},
    tracker::TrackerError,
};

/// Everything the orchestrator's dispatch loop reacts to.
#[derive(Debug)]
pub enum Event {
    // Link lifecycle
    /// An outbound connection attempt completed its handshake
    PeerEstablished {
        link: PeerLink,
    },
    /// An inbound connection completed its handshake
    PeerAccepted {
        link: PeerLink,
    },
    PeerConnectFailed {
        peer: Peer,
        error: LinkError,
    },
    PeerClosed {
        session_id: Uuid,
        error: LinkError,
    },

    // Wire traffic
    PeerMessage {
        session_id: Uuid,
        message: Message,
    },

    // Tracker
    TrackerPeers {
        peers: Vec<Peer>,
        interval: Duration,
    },
    TrackerFailed {
        error: TrackerError,
    },
    ReannounceDue,

    Shutdown,
}
