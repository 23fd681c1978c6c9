use std::{error::Error, fmt::Display, io, time::Duration};

use tokio::{net::TcpStream, time::timeout};
use tracing::warn;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Opens a TCP connection, retrying only when an attempt times out.
///
/// Refused or otherwise failed connections are returned immediately.
pub async fn connect(
    peer_addr: &str,
    connect_timeout: Duration,
    connection_retries: u32,
) -> Result<TcpStream, TcpError> {
    let attempts_allowed = connection_retries.max(1);
    let mut attempts = 0;

    while attempts < attempts_allowed {
        match timeout(connect_timeout, TcpStream::connect(peer_addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                warn!(peer_addr, "Connection refused by peer");
                return Err(TcpError::ConnectionRefused(e));
            }
            Ok(Err(e)) => {
                warn!(peer_addr, error = %e, "Failed to connect to peer");
                return Err(TcpError::ConnectionError(e));
            }
            Err(_) => {
                attempts += 1;
                warn!(peer_addr, attempts, "Connection attempt timed out");
                if attempts < attempts_allowed {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    Err(TcpError::ConnectionTimeout)
}

#[derive(Debug)]
pub enum TcpError {
    ConnectionRefused(io::Error),
    ConnectionError(io::Error),
    ConnectionTimeout,
}

impl Display for TcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpError::ConnectionTimeout => write!(f, "All connection attempts timed out"),
            TcpError::ConnectionRefused(err) => write!(f, "Peer refused connection: {}", err),
            TcpError::ConnectionError(err) => write!(f, "Connection error: {}", err),
        }
    }
}

impl Error for TcpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TcpError::ConnectionRefused(err) | TcpError::ConnectionError(err) => Some(err),
            TcpError::ConnectionTimeout => None,
        }
    }
}
