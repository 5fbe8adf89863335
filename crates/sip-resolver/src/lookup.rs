//! Where live DNS answers come from.
//!
//! [`DnsLookup`] is the seam between the locator and a resolver library.
//! [`HickoryLookup`] asks the system's DNS servers through hickory;
//! [`StaticLookup`] answers from a fixed zone and is what tests use.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig as HickoryConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::records::{ARecord, SrvRecord, normalize_name};

/// A DNS backend. "No such records" is an empty list, not an error.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    async fn lookup_a(&self, name: &str) -> Result<Vec<ARecord>>;
}

/// Live lookups through hickory's tokio resolver
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn new(config: HickoryConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Uses /etc/resolv.conf (or the platform equivalent)
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self { resolver })
    }
}

fn remaining_ttl(valid_until: Instant) -> u32 {
    let secs = valid_until.saturating_duration_since(Instant::now()).as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Empty answers are not failures
fn empty_or_error<T>(name: &str, error: ResolveError) -> Result<Vec<T>> {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(Error::Dns {
            name: name.to_string(),
            reason: error.to_string(),
        }),
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let lookup = match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => return empty_or_error(name, e),
        };
        let ttl = remaining_ttl(lookup.as_lookup().valid_until());
        let records: Vec<SrvRecord> = lookup
            .iter()
            .map(|srv| {
                SrvRecord::new(
                    name,
                    ttl,
                    srv.priority(),
                    srv.weight(),
                    srv.port(),
                    &srv.target().to_ascii(),
                )
            })
            .collect();
        trace!(name, count = records.len(), "SRV answer");
        Ok(records)
    }

    async fn lookup_a(&self, name: &str) -> Result<Vec<ARecord>> {
        let lookup = match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => return empty_or_error(name, e),
        };
        let ttl = remaining_ttl(lookup.as_lookup().valid_until());
        let records: Vec<ARecord> = lookup
            .iter()
            .map(|a| ARecord::new(name, ttl, IpAddr::V4(a.0)))
            .collect();
        trace!(name, count = records.len(), "A answer");
        Ok(records)
    }
}

/// A fixed zone held in memory
#[derive(Default)]
pub struct StaticLookup {
    srv: RwLock<HashMap<String, Vec<SrvRecord>>>,
    a: RwLock<HashMap<String, Vec<ARecord>>>,
    failing: RwLock<HashSet<String>>,
    queries: AtomicUsize,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_srv(&self, record: SrvRecord) {
        self.srv.write().entry(record.name.clone()).or_default().push(record);
    }

    pub fn add_a(&self, record: ARecord) {
        self.a.write().entry(record.name.clone()).or_default().push(record);
    }

    /// Every query for `name` fails from now on
    pub fn fail(&self, name: &str) {
        self.failing.write().insert(normalize_name(name));
    }

    /// Queries answered so far, failed ones included
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    fn answer<R: Clone>(
        &self,
        map: &RwLock<HashMap<String, Vec<R>>>,
        name: &str,
    ) -> Result<Vec<R>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let name = normalize_name(name);
        if self.failing.read().contains(&name) {
            return Err(Error::Dns {
                name,
                reason: "server failure".to_string(),
            });
        }
        Ok(map.read().get(&name).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        self.answer(&self.srv, name)
    }

    async fn lookup_a(&self, name: &str) -> Result<Vec<ARecord>> {
        self.answer(&self.a, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_zone_answers_and_fails() {
        let zone = StaticLookup::new();
        zone.add_a(ARecord::new("Host.example.com", 300, "1.2.3.4".parse().unwrap()));
        zone.fail("broken.example.com");

        let answer = zone.lookup_a("host.example.com.").await.unwrap();
        assert_eq!(answer.len(), 1);
        assert!(zone.lookup_srv("_sip._tcp.host.example.com").await.unwrap().is_empty());
        assert!(matches!(zone.lookup_a("broken.example.com").await, Err(Error::Dns { .. })));
        assert_eq!(zone.queries(), 3);
    }
}
