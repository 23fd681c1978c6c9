use std::{error::Error, fmt::Display, net::SocketAddr, time::Duration};

use protocol::{error::HandshakeError, handshake::Handshake, message::Message};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::torrent::{events::Event, peer::Peer};

use super::{
    handshake::{accept_handshake, exchange_handshake},
    io::{self, IoError},
    keep_alive::{KeepAliveScheduler, KeepAliveTimer},
    tcp::{self, TcpError},
};

/// Lifecycle of a connection to one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// Everything a link needs to reach and greet a peer.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub info_hash: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub connect_timeout: Duration,
    pub connection_retries: u32,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub keep_alive_interval: Duration,
}

/// An established connection to a remote peer.
///
/// Owns the reader, writer and keep-alive tasks for the socket. Outbound messages are
/// queued to the writer so that at most one write is in flight per connection. The
/// protocol state for the peer lives with the orchestrator, not here.
#[derive(Debug)]
pub struct PeerLink {
    session_id: Uuid,
    peer: Peer,
    state: LinkState,
    out_tx: Option<mpsc::UnboundedSender<Message>>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
    keep_alive: KeepAliveScheduler,
}

impl PeerLink {
    /// Dials `peer`, performs the outbound handshake and starts the I/O tasks.
    #[instrument(skip(config, event_tx), fields(peer_addr = %peer.address()))]
    pub async fn connect(
        peer: Peer,
        config: &LinkConfig,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<PeerLink, LinkError> {
        debug!(state = ?LinkState::Connecting, "Opening connection");
        let mut stream = tcp::connect(
            &peer.address(),
            config.connect_timeout,
            config.connection_retries,
        )
        .await?;

        debug!(state = ?LinkState::Handshaking, "Exchanging handshake");
        let local = Handshake::new(config.info_hash, config.local_peer_id);
        let remote = exchange_handshake(&mut stream, &local, config.handshake_timeout).await?;

        let peer = Peer {
            peer_id: peer.peer_id.or(Some(remote.peer_id)),
            ..peer
        };
        Ok(Self::establish(stream, peer, config, event_tx))
    }

    /// Completes an inbound connection accepted by the listener.
    #[instrument(skip(stream, config, event_tx), fields(peer_addr = %addr))]
    pub async fn accept(
        mut stream: TcpStream,
        addr: SocketAddr,
        config: &LinkConfig,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<PeerLink, LinkError> {
        debug!(state = ?LinkState::Handshaking, "Awaiting inbound handshake");
        let local = Handshake::new(config.info_hash, config.local_peer_id);
        let remote = accept_handshake(&mut stream, &local, config.handshake_timeout).await?;

        let peer = Peer {
            peer_id: Some(remote.peer_id),
            ..Peer::from(addr)
        };
        Ok(Self::establish(stream, peer, config, event_tx))
    }

    /// Starts the I/O and keep-alive tasks over an already-greeted stream.
    pub(crate) fn establish<S>(
        stream: S,
        peer: Peer,
        config: &LinkConfig,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> PeerLink
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let timer = KeepAliveTimer::new();

        let (reader, writer) = io::spawn(
            stream,
            session_id,
            out_rx,
            event_tx,
            config.read_timeout,
            timer.clone(),
        );
        let keep_alive = KeepAliveScheduler::start(config.keep_alive_interval, timer, out_tx.clone());

        debug!(%session_id, peer_addr = %peer, state = ?LinkState::Established, "Link established");

        PeerLink {
            session_id,
            peer,
            state: LinkState::Established,
            out_tx: Some(out_tx),
            reader,
            _writer: writer,
            keep_alive,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Queues a message for the writer task.
    pub fn send_message(&self, message: Message) -> Result<(), LinkError> {
        let out_tx = self.out_tx.as_ref().ok_or(LinkError::Closed)?;
        out_tx.send(message).map_err(|_| LinkError::Closed)
    }

    /// Closes the link. Returns true only on the call that performed the close.
    ///
    /// The reader is aborted and the keep-alive task stopped. Messages already queued are
    /// still flushed by the writer before the socket is shut down.
    pub fn disconnect(&mut self) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }

        self.state = LinkState::Closed;
        self.keep_alive.stop();
        self.out_tx.take();
        self.reader.abort();

        debug!(session_id = %self.session_id, peer_addr = %self.peer, "Link closed");
        true
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[derive(Debug)]
pub enum LinkError {
    Tcp(TcpError),
    Handshake(HandshakeError),
    Io(IoError),
    Closed,
}

impl LinkError {
    /// True when the remote side violated the protocol, as opposed to a transport failure.
    /// Such peers are not retried during this session.
    pub fn is_protocol(&self) -> bool {
        match self {
            LinkError::Handshake(e) => matches!(
                e,
                HandshakeError::InfoHashMismatch
                    | HandshakeError::InvalidPstr
                    | HandshakeError::InvalidPstrLength
            ),
            LinkError::Io(e) => e.is_protocol(),
            LinkError::Tcp(_) | LinkError::Closed => false,
        }
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Tcp(e) => write!(f, "TCP error: {}", e),
            LinkError::Handshake(e) => write!(f, "Handshake error: {}", e),
            LinkError::Io(e) => write!(f, "{}", e),
            LinkError::Closed => write!(f, "Link is closed"),
        }
    }
}

impl Error for LinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LinkError::Tcp(e) => Some(e),
            LinkError::Handshake(e) => Some(e),
            LinkError::Io(e) => Some(e),
            LinkError::Closed => None,
        }
    }
}

impl From<TcpError> for LinkError {
    fn from(err: TcpError) -> Self {
        LinkError::Tcp(err)
    }
}

impl From<HandshakeError> for LinkError {
    fn from(err: HandshakeError) -> Self {
        LinkError::Handshake(err)
    }
}

impl From<IoError> for LinkError {
    fn from(err: IoError) -> Self {
        LinkError::Io(err)
    }
}
