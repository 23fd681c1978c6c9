use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// A remote endpoint as learned from the tracker or from an inbound connection.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Peer {
    pub peer_id: Option<[u8; 20]>,
    pub ip: Ip,
    pub port: u16,
}

impl Peer {
    pub fn new(peer_id: Option<[u8; 20]>, ip: Ip, port: u16) -> Self {
        Self { peer_id, ip, port }
    }

    pub fn address(&self) -> String {
        match &self.ip {
            Ip::IpV6(ipv6) => format!("[{}]:{}", ipv6, self.port),
            ip => format!("{}:{}", ip, self.port),
        }
    }

    /// Identities used to deduplicate peers: the peer id when known, then the address.
    ///
    /// A peer queued by address alone learns its id during the handshake, so both keys
    /// have to be released together when it leaves.
    pub fn keys(&self) -> Vec<PeerKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(id) = self.peer_id {
            keys.push(PeerKey::Id(id));
        }
        keys.push(PeerKey::Address(self.address()));
        keys
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => Ip::IpV4(v4),
            IpAddr::V6(v6) => Ip::IpV6(v6),
        };
        Peer::new(None, ip, addr.port())
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum PeerKey {
    Id([u8; 20]),
    Address(String),
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum Ip {
    IpV4(Ipv4Addr),
    IpV6(Ipv6Addr),
    Dns(String),
}

impl From<&str> for Ip {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Ip::IpV4(v4),
            Ok(IpAddr::V6(v6)) => Ip::IpV6(v6),
            Err(_) => Ip::Dns(host.to_string()),
        }
    }
}

impl Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ip::IpV4(ipv4) => write!(f, "{}", ipv4),
            Ip::IpV6(ipv6) => write!(f, "{}", ipv6),
            Ip::Dns(dns) => write!(f, "{}", dns),
        }
    }
}
