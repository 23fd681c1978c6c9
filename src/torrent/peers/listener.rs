use std::io;

use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::torrent::events::Event;

use super::link::{LinkConfig, PeerLink};

/// Binds the first free port in `min..=max`.
pub async fn bind(min: u16, max: u16) -> io::Result<TcpListener> {
    let mut last_error = None;

    for port in min..=max {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                info!(port, "Listening for inbound peers");
                return Ok(listener);
            }
            Err(e) => {
                debug!(port, error = %e, "Port unavailable");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "empty listen port range")
    }))
}

/// Accepts inbound connections, handshaking each one on its own task.
///
/// Greeted links are handed to the orchestrator as `PeerAccepted`; failed handshakes
/// are only logged.
pub fn spawn_accept_loop(
    listener: TcpListener,
    config: LinkConfig,
    event_tx: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept inbound connection");
                    continue;
                }
            };

            let config = config.clone();
            let task_tx = event_tx.clone();
            tokio::spawn(async move {
                match PeerLink::accept(stream, addr, &config, task_tx.clone()).await {
                    Ok(link) => {
                        let _ = task_tx.send(Event::PeerAccepted { link });
                    }
                    Err(e) => debug!(peer_addr = %addr, error = %e, "Inbound handshake failed"),
                }
            });

            if event_tx.is_closed() {
                return;
            }
        }
    })
}
