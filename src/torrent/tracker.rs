use async_trait::async_trait;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde_bencode::{de, value::Value};
use std::{
    collections::HashMap,
    error::Error,
    fmt::Display,
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use url::Url;

use super::peer::{Ip, Peer};

/// Interval used when the tracker omits one or sends a negative value.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(120);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    None,
}

impl AnnounceEvent {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub peers: Vec<Peer>,
    pub interval: Duration,
}

/// Announces over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTracker {
    announce_url: Url,
    client: Client,
}

impl HttpTracker {
    pub fn new(announce_url: &str) -> Result<Self, TrackerError> {
        let url = Url::parse(announce_url).map_err(TrackerError::AnnounceParseError)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TrackerError::UnsupportedProtocol(url.scheme().to_string()));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(TrackerError::HttpRequestError)?;

        Ok(Self {
            announce_url: url,
            client,
        })
    }

    /// Builds the announce URL. The binary fields are percent-encoded by hand so they are
    /// not encoded twice.
    fn build_announce_url(&self, request: &AnnounceRequest) -> Url {
        let mut url = self.announce_url.clone();

        let info_hash = percent_encode(&request.info_hash, NON_ALPHANUMERIC).to_string();
        let peer_id = percent_encode(&request.peer_id, NON_ALPHANUMERIC).to_string();

        let mut query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&", existing),
            _ => String::new(),
        };
        query.push_str(&format!("info_hash={}&peer_id={}", info_hash, peer_id));
        query.push_str(&format!("&port={}", request.port));
        query.push_str(&format!("&uploaded={}", request.uploaded));
        query.push_str(&format!("&downloaded={}", request.downloaded));
        query.push_str(&format!("&left={}", request.left));
        query.push_str("&compact=1");
        if let Some(event) = request.event.as_param() {
            query.push_str(&format!("&event={}", event));
        }

        url.set_query(Some(&query));
        url
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = self.build_announce_url(&request);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(TrackerError::HttpRequestError)?;
        let body = response
            .bytes()
            .await
            .map_err(TrackerError::HttpRequestError)?;

        from_bencoded(&body)
    }
}

/// Parses a bencoded announce response.
pub fn from_bencoded(response: impl AsRef<[u8]>) -> Result<AnnounceResponse, TrackerError> {
    let raw: HashMap<String, Value> =
        de::from_bytes(response.as_ref()).map_err(TrackerError::DecodeError)?;

    if let Some(Value::Bytes(msg)) = raw.get("failure reason").or(raw.get("failure_reason")) {
        return Err(TrackerError::Failure(String::from_utf8_lossy(msg).to_string()));
    }

    let interval = match raw.get("interval") {
        Some(Value::Int(i)) if *i >= 0 => Duration::from_secs(*i as u64),
        _ => DEFAULT_INTERVAL,
    };

    let peers = match raw.get("peers") {
        Some(Value::Bytes(bytes)) => decode_compact_peers(bytes)?,
        Some(Value::List(entries)) => decode_dict_peers(entries),
        Some(_) => return Err(TrackerError::InvalidPeersFormat),
        None => Vec::new(),
    };

    let peers6 = match raw.get("peers6") {
        Some(Value::Bytes(bytes)) => decode_compact_peers6(bytes)?,
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        peers: peers.into_iter().chain(peers6).collect(),
        interval,
    })
}

/// Compact IPv4 peers: 4 address bytes followed by a big-endian port.
fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeersFormat);
    }

    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer::new(None, Ip::IpV4(ip), port)
        })
        .collect())
}

fn decode_compact_peers6(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 18 != 0 {
        return Err(TrackerError::InvalidPeersFormat);
    }

    Ok(bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            Peer::new(None, Ip::IpV6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}

/// Dictionary peers: `peer id`, `ip` and `port` keys. Malformed entries are skipped.
fn decode_dict_peers(entries: &[Value]) -> Vec<Peer> {
    entries
        .iter()
        .filter_map(|entry| {
            let Value::Dict(dict) = entry else {
                return None;
            };

            let ip = match dict.get(b"ip".as_slice()) {
                Some(Value::Bytes(ip)) => Ip::from(String::from_utf8_lossy(ip).as_ref()),
                _ => return None,
            };
            let port = match dict.get(b"port".as_slice()) {
                Some(Value::Int(port)) => u16::try_from(*port).ok()?,
                _ => return None,
            };
            let peer_id = match dict.get(b"peer id".as_slice()) {
                Some(Value::Bytes(id)) => <[u8; 20]>::try_from(id.as_slice()).ok(),
                _ => None,
            };

            Some(Peer::new(peer_id, ip, port))
        })
        .collect()
}

#[derive(Debug)]
pub enum TrackerError {
    InvalidPeersFormat,
    Failure(String),
    HttpRequestError(reqwest::Error),
    DecodeError(serde_bencode::Error),
    AnnounceParseError(url::ParseError),
    UnsupportedProtocol(String),
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::InvalidPeersFormat => write!(f, "Invalid peers format"),
            TrackerError::Failure(reason) => write!(f, "Tracker failure: {}", reason),
            TrackerError::HttpRequestError(e) => write!(f, "HTTP request error: {}", e),
            TrackerError::DecodeError(e) => write!(f, "Error decoding response: {}", e),
            TrackerError::AnnounceParseError(e) => write!(f, "Announce url parse error: {}", e),
            TrackerError::UnsupportedProtocol(e) => write!(f, "Protocol not supported: {}", e),
        }
    }
}

impl Error for TrackerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrackerError::HttpRequestError(err) => Some(err),
            TrackerError::DecodeError(err) => Some(err),
            TrackerError::AnnounceParseError(err) => Some(err),
            _ => None,
        }
    }
}
