//! DNS records as the locator sees them, and where they came from.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Lowercases `name` and makes it fully qualified
pub fn normalize_name(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// `name` without its trailing period
pub fn strip_trailing_period(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrvRecord {
    pub name: String,
    pub ttl: u32,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

impl SrvRecord {
    pub fn new(name: &str, ttl: u32, priority: u16, weight: u16, port: u16, target: &str) -> Self {
        Self {
            name: normalize_name(name),
            ttl,
            priority,
            weight,
            port,
            target: normalize_name(target),
        }
    }
}

impl fmt::Display for SrvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} IN SRV {} {} {} {}",
            self.name, self.ttl, self.priority, self.weight, self.port, self.target
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ARecord {
    pub name: String,
    pub ttl: u32,
    pub address: IpAddr,
}

impl ARecord {
    pub fn new(name: &str, ttl: u32, address: IpAddr) -> Self {
        Self {
            name: normalize_name(name),
            ttl,
            address,
        }
    }
}

impl fmt::Display for ARecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} IN A {}", self.name, self.ttl, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordSource {
    Dns,
    Injected,
    /// The name was already an address
    IpLiteral,
}

/// A record together with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matched<R> {
    pub record: R,
    pub source: RecordSource,
}

impl<R> Matched<R> {
    pub fn dns(record: R) -> Self {
        Self {
            record,
            source: RecordSource::Dns,
        }
    }

    pub fn injected(record: R) -> Self {
        Self {
            record,
            source: RecordSource::Injected,
        }
    }
}

pub type MatchedSrv = Matched<SrvRecord>;
pub type MatchedA = Matched<ARecord>;
