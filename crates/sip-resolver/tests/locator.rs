use std::net::IpAddr;
use std::sync::Arc;

use rvoip_sip_resolver::prelude::*;
use rvoip_sip_resolver::{ARecord, Error, Injected, RecordSource, SrvRecord, StaticLookup};
use rvoip_sip_transport::Transport;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn setup() -> (ServerLocator, Arc<StaticLookup>) {
    init_logging();
    let zone = Arc::new(StaticLookup::new());
    let locator = ServerLocator::new(
        zone.clone(),
        Arc::new(DnsInjectionService::new()),
        ResolverConfig::default(),
    );
    (locator, zone)
}

#[tokio::test]
async fn ip_literal_needs_no_dns() {
    let (locator, zone) = setup();
    let response = locator.resolve("10.0.0.5", TransportLookup::Tcp, None, None).await;

    assert_eq!(response.resolve_type, ResolveType::Ip);
    assert_eq!(response.hops.len(), 1);
    let hop = &response.hops[0];
    assert_eq!(hop.address, ip("10.0.0.5"));
    assert_eq!(hop.transport, Transport::Tcp);
    assert_eq!(hop.port, 5060);
    assert_eq!(hop.host, None);
    assert_eq!(hop.source, RecordSource::IpLiteral);
    assert_eq!(zone.queries(), 0);
}

#[tokio::test]
async fn ip_literal_with_dual_mode_reads_transport_from_port() {
    let (locator, _) = setup();
    let response = locator.resolve("10.0.0.5", TransportLookup::TcpAndTls, Some(5061), None).await;
    assert_eq!(response.hops[0].transport, Transport::Tls);
    assert_eq!(response.hops[0].port, 5061);

    let response = locator.resolve("10.0.0.5", TransportLookup::TlsAndTcp, None, None).await;
    assert_eq!(response.hops[0].transport, Transport::Tcp);
    assert_eq!(response.hops[0].port, 5060);
}

#[tokio::test]
async fn dual_mode_falls_back_to_hostname_on_tcp() {
    let (locator, zone) = setup();
    zone.add_a(ARecord::new("sip.example.com", 300, ip("1.2.3.4")));

    let response = locator.resolve("sip.example.com", TransportLookup::TlsAndTcp, None, None).await;

    assert_eq!(response.resolve_type, ResolveType::Hostname);
    assert_eq!(response.hops.len(), 1);
    let hop = &response.hops[0];
    assert_eq!(hop.address, ip("1.2.3.4"));
    assert_eq!(hop.transport, Transport::Tcp);
    assert_eq!(hop.port, 5060);
    assert_eq!(hop.priority, 0);
    assert_eq!(hop.host.as_deref(), Some("sip.example.com"));
    // _sips._tcp, _sip._tcp, then the A lookup
    assert_eq!(zone.queries(), 3);
    assert!(response.dns_error.is_none());
}

#[tokio::test]
async fn srv_answer_orders_hops_by_priority() {
    let (locator, zone) = setup();
    zone.add_srv(SrvRecord::new("_sip._udp.example.com", 60, 20, 10, 5080, "backup.example.com"));
    zone.add_srv(SrvRecord::new("_sip._udp.example.com", 60, 10, 10, 5070, "primary.example.com"));
    zone.add_a(ARecord::new("primary.example.com", 60, ip("10.0.0.1")));
    zone.add_a(ARecord::new("primary.example.com", 60, ip("10.0.0.2")));
    zone.add_a(ARecord::new("backup.example.com", 60, ip("10.0.0.9")));

    let response = locator.resolve("Example.com", TransportLookup::Udp, None, None).await;

    assert_eq!(response.resolve_type, ResolveType::Srv);
    let hops: Vec<(IpAddr, u16, u16)> =
        response.hops.iter().map(|h| (h.address, h.port, h.priority)).collect();
    assert_eq!(
        hops,
        vec![
            (ip("10.0.0.1"), 5070, 10),
            (ip("10.0.0.2"), 5070, 10),
            (ip("10.0.0.9"), 5080, 20),
        ]
    );
    assert!(response.hops.iter().all(|h| h.transport == Transport::Udp));
    assert_eq!(response.srv_records.len(), 2);
    assert_eq!(response.a_records.len(), 3);
    assert!(!response.log.is_empty());
}

#[tokio::test]
async fn second_transport_srv_is_used_when_first_is_empty() {
    let (locator, zone) = setup();
    zone.add_srv(SrvRecord::new("_sip._tcp.example.com", 60, 10, 0, 5060, "tcp.example.com"));
    zone.add_a(ARecord::new("tcp.example.com", 60, ip("10.0.1.1")));

    let response = locator.resolve("example.com", TransportLookup::TlsAndTcp, None, None).await;

    assert_eq!(response.resolve_type, ResolveType::Srv);
    assert_eq!(response.hops.len(), 1);
    assert_eq!(response.hops[0].transport, Transport::Tcp);
    assert_eq!(response.hops[0].host.as_deref(), Some("tcp.example.com"));
}

#[tokio::test]
async fn explicit_port_skips_srv() {
    let (locator, zone) = setup();
    zone.add_srv(SrvRecord::new("_sip._tcp.example.com", 60, 10, 0, 5999, "other.example.com"));
    zone.add_a(ARecord::new("example.com", 60, ip("10.0.2.1")));
    zone.add_a(ARecord::new("example.com", 60, ip("10.0.2.2")));

    let response = locator.resolve("example.com", TransportLookup::Tcp, Some(5090), None).await;

    assert_eq!(response.resolve_type, ResolveType::Hostname);
    assert_eq!(response.hops.len(), 2);
    assert!(response.hops.iter().all(|h| h.port == 5090 && h.transport == Transport::Tcp));
    assert!(response.srv_records.is_empty());
    assert_eq!(zone.queries(), 1);
}

#[tokio::test]
async fn blocked_name_resolves_to_nothing() {
    let (locator, zone) = setup();
    zone.add_a(ARecord::new("blocked.example.com", 60, ip("10.0.3.1")));
    locator.injection().inject_a(
        None,
        vec![Injected::new(
            ARecord::new("blocked.example.com", 60, ip("0.0.0.0")),
            InjectAction::Block,
        )],
    );

    let response = locator
        .resolve("blocked.example.com", TransportLookup::Udp, Some(5060), None)
        .await;

    assert!(response.hops.is_empty());
    assert!(response.dns_error.is_none());
    assert_eq!(zone.queries(), 0);
}

#[tokio::test]
async fn prepended_srv_goes_ahead_of_live_answer() {
    let (locator, zone) = setup();
    zone.add_srv(SrvRecord::new("_sip._udp.example.com", 60, 10, 0, 5060, "live.example.com"));
    zone.add_a(ARecord::new("live.example.com", 60, ip("10.0.4.1")));
    locator.injection().inject_srv(
        None,
        vec![Injected::new(
            SrvRecord::new("_sip._udp.example.com", 60, 1, 0, 5062, "lab.example.com"),
            InjectAction::Prepend,
        )],
    );
    locator.injection().inject_a(
        None,
        vec![Injected::new(
            ARecord::new("lab.example.com", 60, ip("192.0.2.50")),
            InjectAction::Replace,
        )],
    );

    let response = locator.resolve("example.com", TransportLookup::Udp, None, None).await;

    assert_eq!(response.resolve_type, ResolveType::Srv);
    assert_eq!(response.hops.len(), 2);
    assert_eq!(response.hops[0].address, ip("192.0.2.50"));
    assert_eq!(response.hops[0].port, 5062);
    assert_eq!(response.hops[0].source, RecordSource::Injected);
    assert_eq!(response.hops[1].address, ip("10.0.4.1"));
    assert_eq!(response.hops[1].source, RecordSource::Dns);
}

#[tokio::test]
async fn lookup_failure_is_captured_not_returned() {
    let (locator, zone) = setup();
    zone.fail("_sip._udp.broken.example.com");
    zone.fail("broken.example.com");

    let response = locator.resolve("broken.example.com", TransportLookup::Udp, None, None).await;

    assert!(response.hops.is_empty());
    match response.dns_error {
        Some(Error::Dns { name, .. }) => assert_eq!(name, "_sip._udp.broken.example.com."),
        other => panic!("expected the first DNS failure, got {:?}", other),
    }
}
