//! # Server location
//!
//! [`ServerLocator::resolve`] turns a name, a transport preference and an
//! optional port into an ordered list of [`Hop`]s:
//!
//! 1. an IP literal is returned as the only hop, no DNS involved
//! 2. with an explicit port the name is a host: A lookup only
//! 3. otherwise SRV is tried for each preferred transport in turn, and the
//!    targets of the first non-empty answer are resolved to addresses
//! 4. with no SRV answer the name itself is looked up, on the transport's
//!    default port
//!
//! Every query consults the [`DnsInjectionService`] first. Lookup failures
//! never escape: the first one is kept on the [`LocateResponse`] so callers
//! can tell "no records" from "lookup failed".

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::join_all;
use rvoip_sip_transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::hop::{Hop, TransportLookup, srv_prefix};
use crate::injection::{DnsInjectionService, Override};
use crate::lookup::{DnsLookup, HickoryLookup};
use crate::records::{
    ARecord, Matched, MatchedA, MatchedSrv, RecordSource, SrvRecord, normalize_name,
    strip_trailing_period,
};
use crate::srv_order::order_srv;

/// How the hops of a response were found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolveType {
    #[default]
    Unknown,
    Ip,
    Hostname,
    Srv,
}

impl fmt::Display for ResolveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolveType::Unknown => "UNKNOWN",
            ResolveType::Ip => "IP",
            ResolveType::Hostname => "HOSTNAME",
            ResolveType::Srv => "SRV",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocateResponse {
    /// Candidates in the order they should be tried
    pub hops: Vec<Hop>,
    /// SRV records consulted, in selection order
    pub srv_records: Vec<MatchedSrv>,
    pub a_records: Vec<MatchedA>,
    /// Human readable trace of the lookups made
    pub log: Vec<String>,
    pub resolve_type: ResolveType,
    /// First lookup failure, if any
    #[serde(skip)]
    pub dns_error: Option<Error>,
}

impl LocateResponse {
    fn note(&mut self, line: String) {
        debug!(trace = %line, "locate");
        self.log.push(line);
    }

    fn absorb<R>(&mut self, query: &mut Query<R>) {
        for line in query.log.drain(..) {
            self.note(line);
        }
        if let Some(error) = query.error.take() {
            warn!(error = %error, "DNS lookup failed");
            self.dns_error.get_or_insert(error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Outcome of one (possibly injected) query
struct Query<R> {
    records: Vec<Matched<R>>,
    log: Vec<String>,
    error: Option<Error>,
}

impl<R> Query<R> {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            log: Vec::new(),
            error: None,
        }
    }
}

pub struct ServerLocator {
    lookup: Arc<dyn DnsLookup>,
    injection: Arc<DnsInjectionService>,
    config: ResolverConfig,
}

impl ServerLocator {
    pub fn new(
        lookup: Arc<dyn DnsLookup>,
        injection: Arc<DnsInjectionService>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            lookup,
            injection,
            config,
        }
    }

    /// Locator backed by the system's DNS configuration
    pub fn from_system_conf(config: ResolverConfig) -> Result<Self> {
        let lookup = HickoryLookup::from_system_conf()?;
        Ok(Self::new(Arc::new(lookup), Arc::new(DnsInjectionService::new()), config))
    }

    pub fn injection(&self) -> &Arc<DnsInjectionService> {
        &self.injection
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn is_supported(&self, transport: Transport) -> bool {
        self.config.supports(transport)
    }

    /// Locates `name`. `user` selects that user's injected records, falling
    /// back to the global ones.
    pub async fn resolve(
        &self,
        name: &str,
        transport: TransportLookup,
        port: Option<u16>,
        user: Option<&str>,
    ) -> LocateResponse {
        let mut response = LocateResponse::default();
        let name = name.trim();
        let literal = name.trim_start_matches('[').trim_end_matches(']');

        if let Ok(address) = literal.parse::<IpAddr>() {
            let transport = transport.for_port(port);
            let port = port.unwrap_or(transport.default_port());
            response.resolve_type = ResolveType::Ip;
            response.hops.push(Hop {
                host: None,
                address,
                transport,
                port,
                priority: 0,
                source: RecordSource::IpLiteral,
            });
            response.note(format!("{} is an IP address; using {}:{}", address, transport, port));
            return response;
        }

        if let Some(port) = port {
            let transport = transport.for_port(Some(port));
            response.note(format!("explicit port {}; skipping SRV for {}", port, name));
            self.resolve_host(&mut response, name, transport, port, user).await;
            return response;
        }

        for &candidate in transport.transports() {
            let Some(prefix) = srv_prefix(candidate) else {
                continue;
            };
            if !self.is_supported(candidate) {
                response.note(format!("{} not supported; no SRV query", candidate));
                continue;
            }
            let srv_name = format!("{}{}", prefix, normalize_name(name));
            let mut query = self.query_srv(&srv_name, user).await;
            response.absorb(&mut query);
            if query.records.is_empty() {
                continue;
            }
            let ordered = order_srv(query.records, &mut rand::thread_rng());
            self.resolve_targets(&mut response, ordered, candidate, user).await;
            response.resolve_type = ResolveType::Srv;
            return response;
        }

        let fallback = transport.single().unwrap_or(Transport::Tcp);
        let port = fallback.default_port();
        response.note(format!("no SRV records; looking up {} as {}:{}", name, fallback, port));
        self.resolve_host(&mut response, name, fallback, port, user).await;
        response
    }

    async fn resolve_host(
        &self,
        response: &mut LocateResponse,
        name: &str,
        transport: Transport,
        port: u16,
        user: Option<&str>,
    ) {
        let mut query = self.query_a(name, user).await;
        response.absorb(&mut query);
        response.resolve_type = ResolveType::Hostname;
        for a in query.records {
            response.hops.push(Hop {
                host: Some(strip_trailing_period(&a.record.name).to_string()),
                address: a.record.address,
                transport,
                port,
                priority: 0,
                source: a.source,
            });
            response.a_records.push(a);
        }
    }

    /// One hop per (SRV record, address) pair, in SRV order
    async fn resolve_targets(
        &self,
        response: &mut LocateResponse,
        ordered: Vec<MatchedSrv>,
        transport: Transport,
        user: Option<&str>,
    ) {
        let queries =
            join_all(ordered.iter().map(|srv| self.query_a(&srv.record.target, user))).await;
        for (srv, mut query) in ordered.into_iter().zip(queries) {
            response.absorb(&mut query);
            for a in query.records {
                let injected =
                    srv.source == RecordSource::Injected || a.source == RecordSource::Injected;
                let source = if injected {
                    RecordSource::Injected
                } else {
                    RecordSource::Dns
                };
                response.hops.push(Hop {
                    host: Some(strip_trailing_period(&srv.record.target).to_string()),
                    address: a.record.address,
                    transport,
                    port: srv.record.port,
                    priority: srv.record.priority,
                    source,
                });
                response.a_records.push(a);
            }
            response.srv_records.push(srv);
        }
    }

    async fn query_srv(&self, name: &str, user: Option<&str>) -> Query<SrvRecord> {
        let over = self.injection.srv_override(user, name);
        self.query("SRV", name, over, self.lookup.lookup_srv(name)).await
    }

    async fn query_a(&self, name: &str, user: Option<&str>) -> Query<ARecord> {
        let over = self.injection.a_override(user, name);
        self.query("A", name, over, self.lookup.lookup_a(name)).await
    }

    async fn query<R, F>(&self, kind: &str, name: &str, over: Override<R>, live: F) -> Query<R>
    where
        R: fmt::Display,
        F: Future<Output = Result<Vec<R>>>,
    {
        let mut query = Query::new();
        let live_too = match over {
            Override::Block => {
                query.log.push(format!("{} {} blocked by injection", kind, name));
                return query;
            }
            Override::Replace(records) => {
                query.log.push(format!(
                    "{} {} replaced by {} injected record(s)",
                    kind,
                    name,
                    records.len()
                ));
                query.records.extend(records.into_iter().map(Matched::injected));
                false
            }
            Override::Prepend(records) => {
                query.log.push(format!(
                    "{} {}: {} injected record(s) first",
                    kind,
                    name,
                    records.len()
                ));
                query.records.extend(records.into_iter().map(Matched::injected));
                true
            }
            Override::None => true,
        };
        if !live_too {
            return query;
        }

        let timeout = self.config.lookup_timeout();
        match tokio::time::timeout(timeout, live).await {
            Ok(Ok(records)) => {
                for record in &records {
                    query.log.push(format!("{}", record));
                }
                if records.is_empty() {
                    query.log.push(format!("no {} records for {}", kind, name));
                }
                query.records.extend(records.into_iter().map(Matched::dns));
            }
            Ok(Err(error)) => {
                query.log.push(format!("{} lookup for {} failed: {}", kind, name, error));
                query.error = Some(error);
            }
            Err(_) => {
                query.log.push(format!("{} lookup for {} timed out", kind, name));
                query.error = Some(Error::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        }
        query
    }
}
