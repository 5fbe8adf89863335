//! Transport kinds and the binding descriptor attached to every connection.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Transport used by a connection or hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Multicast,
}

impl Transport {
    /// Default SIP port for this transport
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Tls => 5061,
            _ => 5060,
        }
    }

    /// Connection-oriented transports serialize sends and never retransmit
    pub fn is_reliable(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Tls)
    }

    pub fn is_stream(self) -> bool {
        self.is_reliable()
    }

    /// Token as it appears in a Via header or a `transport=` parameter
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
            Transport::Multicast => "MULTICAST",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Transport::Udp),
            "TCP" => Ok(Transport::Tcp),
            "TLS" => Ok(Transport::Tls),
            "MULTICAST" => Ok(Transport::Multicast),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Negotiated TLS session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSessionInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub server_name: Option<String>,
    /// DER encoded peer certificate chain
    pub peer_certificates: Vec<Vec<u8>>,
}

/// Describes both ends of a connection plus its transport
///
/// `BindingInfo` is a value type: it is cloned whenever it crosses a thread
/// boundary rather than shared mutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: Transport,
    /// Name of the network (interface group) this binding belongs to
    pub network: String,
    /// Correlates a connection with a registration behind NAT
    pub connection_id: Option<String>,
    pub tls_session: Option<Arc<TlsSessionInfo>>,
}

impl BindingInfo {
    pub const DEFAULT_NETWORK: &'static str = "default";

    pub fn new(local: SocketAddr, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            local,
            remote,
            transport,
            network: Self::DEFAULT_NETWORK.to_string(),
            connection_id: None,
            tls_session: None,
        }
    }

    /// Binding for an outbound connection whose local side is not yet known
    pub fn outbound(remote: SocketAddr, transport: Transport) -> Self {
        Self::new(unspecified_for(&remote), remote, transport)
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    pub fn local_is_unspecified(&self) -> bool {
        self.local.ip().is_unspecified()
    }
}

impl fmt::Display for BindingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.transport, self.local, self.remote)
    }
}

/// Wildcard local address of the same family as `remote`
pub(crate) fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        assert_eq!(Transport::Udp.default_port(), 5060);
        assert_eq!(Transport::Tcp.default_port(), 5060);
        assert_eq!(Transport::Tls.default_port(), 5061);
    }

    #[test]
    fn transport_tokens_round_trip() {
        for t in [Transport::Udp, Transport::Tcp, Transport::Tls, Transport::Multicast] {
            assert_eq!(t.as_str().to_lowercase().parse::<Transport>().unwrap(), t);
        }
        assert!("sctp".parse::<Transport>().is_err());
    }

    #[test]
    fn outbound_binding_uses_wildcard_local() {
        let remote: SocketAddr = "192.0.2.1:5060".parse().unwrap();
        let binding = BindingInfo::outbound(remote, Transport::Tcp);
        assert!(binding.local_is_unspecified());
        assert_eq!(binding.network, "default");
    }
}
