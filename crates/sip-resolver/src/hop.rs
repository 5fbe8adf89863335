//! Candidate next hops and the transport preference they are located for.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rvoip_sip_transport::Transport;
use serde::{Deserialize, Serialize};

use crate::records::RecordSource;

/// Transport preference for one locate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportLookup {
    Tcp,
    Udp,
    Tls,
    /// TLS first, then TCP
    TlsAndTcp,
    /// TCP first, then TLS
    TcpAndTls,
}

impl TransportLookup {
    /// Transports in the order they are tried
    pub fn transports(self) -> &'static [Transport] {
        match self {
            TransportLookup::Tcp => &[Transport::Tcp],
            TransportLookup::Udp => &[Transport::Udp],
            TransportLookup::Tls => &[Transport::Tls],
            TransportLookup::TlsAndTcp => &[Transport::Tls, Transport::Tcp],
            TransportLookup::TcpAndTls => &[Transport::Tcp, Transport::Tls],
        }
    }

    pub fn single(self) -> Option<Transport> {
        match self.transports() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Transport to use when the port is already known. The dual modes read
    /// it from the port: none or 5060 is TCP, anything else TLS.
    pub fn for_port(self, port: Option<u16>) -> Transport {
        match self.single() {
            Some(transport) => transport,
            None => match port {
                None | Some(5060) => Transport::Tcp,
                Some(_) => Transport::Tls,
            },
        }
    }
}

/// SRV service label for `transport`, or `None` where SIP has no SRV name
pub fn srv_prefix(transport: Transport) -> Option<&'static str> {
    match transport {
        Transport::Udp => Some("_sip._udp."),
        Transport::Tcp => Some("_sip._tcp."),
        Transport::Tls => Some("_sips._tcp."),
        Transport::Multicast => None,
    }
}

/// One resolved candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// Name the address was found for; `None` for IP literals
    pub host: Option<String>,
    pub address: IpAddr,
    pub transport: Transport,
    pub port: u16,
    pub priority: u16,
    pub source: RecordSource,
}

impl Hop {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{} ", host)?;
        }
        write!(
            f,
            "{} {} priority {} ({:?})",
            self.socket_addr(),
            self.transport,
            self.priority,
            self.source
        )
    }
}
