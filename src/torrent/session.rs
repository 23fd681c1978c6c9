use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info, warn};

use crate::config::Config;

use super::{
    events::Event,
    metainfo::{Metainfo, MetainfoError},
    orchestrator::{Orchestrator, OrchestratorConfig, SwarmError, SwarmSummary},
    peers::{link::LinkConfig, listener},
    stats,
    store::{PieceStore, StoreError},
    tracker::{AnnounceEvent, HttpTracker, Tracker, TrackerError},
};

const CLIENT_ID: &str = "WB";

/// Downloads one torrent into `destination`, or into `disk.download_path/<name>` when no
/// destination is given, and returns once it completes or Ctrl-C is pressed.
pub async fn run(
    config: &Config,
    torrent_path: &Path,
    destination: Option<PathBuf>,
) -> Result<SwarmSummary, SessionError> {
    let metainfo = Metainfo::from_file(torrent_path)?;
    debug!(
        torrent_name = %metainfo.name,
        info_hash = %hex::encode(metainfo.info_hash),
        pieces = metainfo.num_pieces(),
        "Loaded metainfo"
    );

    let destination =
        destination.unwrap_or_else(|| Path::new(&config.disk.download_path).join(&metainfo.name));
    let store = PieceStore::open(&destination, metainfo.piece_length, metainfo.pieces())?;

    let local = store.scan_existing()?;
    let stats_path = stats::stats_path(&destination);
    let uploaded = stats::load_uploaded(&stats_path);
    info!(
        path = %destination.display(),
        verified = local.count(),
        total = local.num_pieces(),
        "Resume scan finished"
    );

    if local.is_complete() {
        info!("All pieces already present, nothing to download");
        return Ok(SwarmSummary {
            completed: true,
            downloaded: store.total_length(),
            uploaded,
        });
    }

    let peer_id = generate_peer_id();
    debug!(peer_id = %String::from_utf8_lossy(&peer_id), "Generated session peer ID");

    let listener = listener::bind(
        config.network.listen_port_min,
        config.network.listen_port_max,
    )
    .await
    .map_err(SessionError::Listen)?;
    let listen_port = listener.local_addr().map_err(SessionError::Listen)?.port();

    let tracker: Arc<dyn Tracker> = Arc::new(HttpTracker::new(&metainfo.announce)?);

    let link = LinkConfig {
        info_hash: metainfo.info_hash,
        local_peer_id: peer_id,
        connect_timeout: config.network.connect_timeout(),
        connection_retries: config.network.connection_retries,
        handshake_timeout: config.network.handshake_timeout(),
        read_timeout: config.network.read_timeout(),
        keep_alive_interval: config.network.keep_alive_interval(),
    };
    let orchestrator_config = OrchestratorConfig {
        link: link.clone(),
        listen_port,
        max_connections: config.swarm.max_connections,
        max_unchoked: config.swarm.max_unchoked,
        block_size: config.swarm.block_size,
        random_draws: config.swarm.random_draws,
    };
    let orchestrator = Orchestrator::new(orchestrator_config, store, local, Arc::clone(&tracker))
        .with_stats(stats_path, uploaded);

    let response = tracker
        .announce(orchestrator.announce_request(AnnounceEvent::Started))
        .await?;
    info!(
        peer_count = response.peers.len(),
        interval = ?response.interval,
        "Tracker announce succeeded"
    );

    let accept = listener::spawn_accept_loop(listener, link, orchestrator.event_sender());
    let shutdown_tx = orchestrator.event_sender();
    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(Event::Shutdown);
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let result = orchestrator.run(response.peers, response.interval).await;
    accept.abort();
    signal.abort();

    Ok(result?)
}

pub fn client_version() -> String {
    let version_tag = env!("CARGO_PKG_VERSION").replace('.', "");
    let version = version_tag
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(4)
        .collect::<String>();

    format!("{:0<4}", version)
}

/// `-WB<version>-` followed by 12 random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let random_seq: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();

    let format = format!("-{}{}-{}", CLIENT_ID, client_version(), random_seq);

    let mut id = [0u8; 20];
    id.copy_from_slice(format.as_bytes());
    id
}

#[derive(Debug)]
pub enum SessionError {
    Metainfo(MetainfoError),
    Store(StoreError),
    Listen(io::Error),
    Tracker(TrackerError),
    Swarm(SwarmError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Metainfo(e) => write!(f, "Invalid torrent file: {}", e),
            SessionError::Store(e) => write!(f, "Destination file error: {}", e),
            SessionError::Listen(e) => write!(f, "Failed to open listening port: {}", e),
            SessionError::Tracker(e) => write!(f, "Initial announce failed: {}", e),
            SessionError::Swarm(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Metainfo(e) => Some(e),
            SessionError::Store(e) => Some(e),
            SessionError::Listen(e) => Some(e),
            SessionError::Tracker(e) => Some(e),
            SessionError::Swarm(e) => Some(e),
        }
    }
}

impl From<MetainfoError> for SessionError {
    fn from(err: MetainfoError) -> Self {
        SessionError::Metainfo(err)
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Store(err)
    }
}

impl From<TrackerError> for SessionError {
    fn from(err: TrackerError) -> Self {
        SessionError::Tracker(err)
    }
}

impl From<SwarmError> for SessionError {
    fn from(err: SwarmError) -> Self {
        SessionError::Swarm(err)
    }
}
