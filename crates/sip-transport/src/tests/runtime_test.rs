//! Loopback tests for the whole transport runtime
//!
//! `connect` blocks on the runtime's tokio handle, so these are plain tests
//! that own their tokio runtime instead of `#[tokio::test]`.

use std::io::{Read, Write};
use std::net::{
    SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serial_test::serial;

use crate::transport::tls::{client_config_from_pem, server_config_from_pem};
use crate::{
    Connection, Error, MessageSink, QueueConfig, Transport, TransportConfig, TransportRuntime,
    WorkerContext,
};

const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
    Via: SIP/2.0/UDP 127.0.0.1\r\nContent-Length: 0\r\n\r\n";
const OPTIONS: &[u8] = b"OPTIONS sip:bob@example.com SIP/2.0\r\nContent-Length: 4\r\n\r\nping";

struct Received {
    message: Bytes,
    remote: SocketAddr,
    transport: Transport,
}

struct Collector(Mutex<Sender<Received>>);

impl MessageSink for Collector {
    fn on_message(&self, message: Bytes, connection: &Arc<Connection>, _ctx: &WorkerContext) {
        let _ = self.0.lock().unwrap().send(Received {
            message,
            remote: connection.remote_addr(),
            transport: connection.transport(),
        });
    }
}

fn tokio_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn test_config() -> TransportConfig {
    TransportConfig {
        small_maps: true,
        connect_timeout_ms: 2000,
        io_queue: QueueConfig::new("IO_WORK").with_max_threads(2),
        ..Default::default()
    }
}

fn start(
    rt: &tokio::runtime::Runtime,
    config: TransportConfig,
) -> (TransportRuntime, Receiver<Received>) {
    let transport = TransportRuntime::new(config, rt.handle().clone()).unwrap();
    let (tx, rx) = mpsc::channel();
    transport.set_sink(Arc::new(Collector(Mutex::new(tx))));
    (transport, rx)
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
#[serial]
fn udp_datagram_reaches_sink() {
    let rt = tokio_runtime();
    let (transport, rx) = start(&rt, test_config());
    let local = transport.listen_udp(loopback()).unwrap();

    let client = StdUdpSocket::bind(loopback()).unwrap();
    client.send_to(INVITE, local).unwrap();
    // keep-alive datagrams never reach the sink
    client.send_to(b"\r\n\r\n", local).unwrap();
    client.send_to(OPTIONS, local).unwrap();

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&first.message[..], INVITE);
    assert_eq!(first.transport, Transport::Udp);
    assert_eq!(first.remote, client.local_addr().unwrap());

    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&second.message[..], OPTIONS);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // both datagrams came from one peer, so there is one connection
    assert_eq!(transport.connections().count(Transport::Udp), 1);
    assert!(transport.listening().contains(&(local, Transport::Udp)));
}

#[test]
#[serial]
fn oversized_udp_send_is_refused() {
    let rt = tokio_runtime();
    let config = TransportConfig {
        max_udp_packet_size: 100,
        ..test_config()
    };
    let (transport, _rx) = start(&rt, config);
    let dest: SocketAddr = "127.0.0.1:5060".parse().unwrap();
    let err = transport.send(&[b'x'; 101], dest, Transport::Udp).unwrap_err();
    assert!(matches!(err, Error::MessageTooLarge(101)));
}

#[test]
#[serial]
fn tcp_stream_is_framed_and_connection_reused() {
    let rt = tokio_runtime();
    let (transport, rx) = start(&rt, test_config());
    let local = transport.listen_tcp(loopback()).unwrap();

    let mut pipelined = Vec::new();
    pipelined.extend_from_slice(INVITE);
    pipelined.extend_from_slice(b"\r\n\r\n");
    pipelined.extend_from_slice(OPTIONS);
    assert_eq!(transport.send(&pipelined, local, Transport::Tcp).unwrap(), pipelined.len());

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&first.message[..], INVITE);
    assert_eq!(&second.message[..], OPTIONS);
    assert_eq!(first.transport, Transport::Tcp);

    let outbound = transport.connect(local, Transport::Tcp).unwrap();
    let again = transport.connect(local, Transport::Tcp).unwrap();
    assert_eq!(outbound.id(), again.id());
    assert_eq!(outbound.remote_addr(), local);
}

#[test]
#[serial]
fn peer_close_removes_stream_connection() {
    let rt = tokio_runtime();
    let (transport, rx) = start(&rt, test_config());
    let local = transport.listen_tcp(loopback()).unwrap();

    let mut peer = StdTcpStream::connect(local).unwrap();
    peer.write_all(INVITE).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(transport.connections().count(Transport::Tcp), 1);

    drop(peer);
    assert!(wait_until(Duration::from_secs(5), || {
        transport.connections().count(Transport::Tcp) == 0
    }));
}

#[test]
#[serial]
fn tls_round_trip_records_session() {
    let rt = tokio_runtime();
    let (transport, rx) = start(&rt, test_config());

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();
    let server = server_config_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    let client = client_config_from_pem(Some(cert_pem.as_bytes())).unwrap();
    transport.set_tls(Some(server), Some(client));

    let local = transport.listen_tls(loopback()).unwrap();
    let connection = transport
        .connect_named(local, Transport::Tls, Some("localhost"))
        .unwrap();
    assert!(!connection.is_connecting());
    let session = connection.binding().tls_session.expect("session recorded after handshake");
    assert!(session.cipher_suite.is_some());

    connection.send(INVITE).unwrap();
    let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&received.message[..], INVITE);
    assert_eq!(received.transport, Transport::Tls);
}

#[test]
#[serial]
fn tls_listener_requires_certificate() {
    let rt = tokio_runtime();
    let (transport, _rx) = start(&rt, test_config());
    assert!(matches!(
        transport.listen_tls(loopback()),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
#[serial]
fn failed_connect_marks_destination_unreachable() {
    let rt = tokio_runtime();
    let (transport, _rx) = start(&rt, test_config());

    let closed = {
        let listener = StdTcpListener::bind(loopback()).unwrap();
        listener.local_addr().unwrap()
    };
    let err = transport.connect(closed, Transport::Tcp).unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(..) | Error::ConnectionTimeout(..)), "{err}");
    assert!(transport.unreachable().contains(closed.ip(), closed.port(), Transport::Tcp));

    // the second attempt is refused without touching the network
    let err = transport.connect(closed, Transport::Tcp).unwrap_err();
    assert!(matches!(err, Error::Unreachable(addr, Transport::Tcp) if addr == closed));
    // other transports to the same address are unaffected
    assert!(!transport.unreachable().contains(closed.ip(), closed.port(), Transport::Tls));
}

#[test]
#[serial]
fn stream_listener_pauses_at_connection_limit() {
    let rt = tokio_runtime();
    let config = TransportConfig {
        max_connections: 1,
        ..test_config()
    };
    let (transport, rx) = start(&rt, config);
    let local = transport.listen_tcp(loopback()).unwrap();

    let mut first = StdTcpStream::connect(local).unwrap();
    first.write_all(INVITE).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!transport.connections().accepting_streams());

    // accepted and closed straight away
    let mut second = StdTcpStream::connect(local).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    let n = second.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(transport.connections().count(Transport::Tcp), 1);

    drop(first);
    assert!(wait_until(Duration::from_secs(5), || transport.connections().accepting_streams()));
}

#[test]
#[serial]
fn shutdown_closes_everything() {
    let rt = tokio_runtime();
    let (transport, rx) = start(&rt, test_config());
    let local = transport.listen_tcp(loopback()).unwrap();
    transport.send(INVITE, local, Transport::Tcp).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!transport.connections().is_empty());

    transport.shutdown();
    assert!(!transport.reactor().is_running());
    assert!(transport.connections().is_empty());
    // idempotent
    transport.shutdown();
}
