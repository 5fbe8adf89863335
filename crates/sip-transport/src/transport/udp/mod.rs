//! UDP and multicast transport.
//!
//! A listening socket is shared by every per-peer [`Connection`] created for
//! datagrams arriving on it, so responses leave from the port the request
//! reached. Outbound datagrams with no listener go through a
//! [`UdpSocketPool`] holding one socket per IO worker.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Interest;
use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::binding::{BindingInfo, Transport};
use crate::connection::{Connection, ConnectionKey, ConnectionTable, Link};
use crate::error::{Error, Result};
use crate::framing::check_datagram;
use crate::queue::WorkerContext;
use crate::reactor::{Readiness, ReadyHandler, Rearm};
use crate::transport::SinkSlot;

const RECV_BUFFER_BYTES: usize = 1024 * 1024;
/// How long a send waits for room in a full socket buffer
const SEND_DEADLINE: Duration = Duration::from_millis(250);
/// Datagrams shed per discarded readiness event
const DISCARD_DRAIN_LIMIT: usize = 256;

/// Binds a non-blocking UDP socket with address reuse
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        debug!(%addr, error = %e, "could not raise receive buffer");
    }
    socket.bind(&addr.into()).map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    let std_socket: StdUdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}

/// Binds to `port` and joins `group` on `interface`
pub fn bind_multicast(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket.bind(&addr.into()).map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .join_multicast_v4(&group, &interface)
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    info!(%group, port, %interface, "joined multicast group");
    let std_socket: StdUdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket))
}

/// Datagram link to one peer over a shared socket
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpLink {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote }
    }
}

fn send_datagram(socket: &UdpSocket, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
    retry_until(SEND_DEADLINE, || socket.send_to(buf, dest))
}

/// Retries `send` while the socket buffer is full. `WouldBlock` is returned
/// once `deadline` has passed.
fn retry_until(
    deadline: Duration,
    mut send: impl FnMut() -> io::Result<usize>,
) -> io::Result<usize> {
    let give_up = Instant::now() + deadline;
    loop {
        match send() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= give_up {
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

impl Link for UdpLink {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        send_datagram(&self.socket, buf, self.remote)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        send_datagram(&self.socket, buf, dest)
    }

    fn close(&self) -> io::Result<()> {
        // the socket belongs to the listener or pool
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// One outbound UDP socket per IO worker
pub struct UdpSocketPool {
    sockets: Vec<Arc<UdpSocket>>,
    next: AtomicUsize,
}

impl UdpSocketPool {
    pub fn bind(workers: usize, local_ip: std::net::IpAddr) -> Result<Self> {
        let workers = workers.max(1);
        let mut sockets = Vec::with_capacity(workers);
        for _ in 0..workers {
            sockets.push(Arc::new(bind_udp(SocketAddr::new(local_ip, 0))?));
        }
        debug!(workers, "udp socket pool ready");
        Ok(Self {
            sockets,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Socket owned by worker `worker_id`
    pub fn for_worker(&self, worker_id: usize) -> &Arc<UdpSocket> {
        &self.sockets[worker_id % self.sockets.len()]
    }

    /// Round-robin pick for callers outside the worker pool
    pub fn next(&self) -> &Arc<UdpSocket> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        &self.sockets[index % self.sockets.len()]
    }

    pub fn send_from_worker(
        &self,
        ctx: &WorkerContext,
        buf: &[u8],
        dest: SocketAddr,
    ) -> Result<usize> {
        send_datagram(self.for_worker(ctx.worker_id), buf, dest)
            .map_err(|e| Error::SendFailed(dest, e))
    }
}

impl fmt::Debug for UdpSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSocketPool")
            .field("sockets", &self.sockets.len())
            .finish()
    }
}

/// Reads datagrams from a listening socket
pub(crate) struct DatagramHandler {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    transport: Transport,
    table: Arc<ConnectionTable>,
    sink: SinkSlot,
    max_packet: usize,
    idle_timeout: Duration,
}

impl DatagramHandler {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        transport: Transport,
        table: Arc<ConnectionTable>,
        sink: SinkSlot,
        max_packet: usize,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            transport,
            table,
            sink,
            max_packet,
            idle_timeout,
        })
    }

    fn connection_for(&self, source: SocketAddr) -> Arc<Connection> {
        let key = ConnectionKey::new(self.local, source, self.transport);
        if let Some(existing) = self.table.get(&key) {
            if !existing.is_shutdown() {
                return existing;
            }
        }
        let connection = Arc::new(Connection::new(
            BindingInfo::new(self.local, source, self.transport),
            Box::new(UdpLink::new(self.socket.clone(), source)),
            self.idle_timeout,
        ));
        self.table.put(connection.clone());
        connection
    }
}

impl ReadyHandler for DatagramHandler {
    fn handle_ready(&self, _ready: Readiness, ctx: &WorkerContext) -> Rearm {
        // one extra byte detects datagrams over the limit
        let mut buf = vec![0u8; self.max_packet + 1];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, source)) => {
                    let Some(message) = check_datagram(&buf[..n], self.max_packet) else {
                        continue;
                    };
                    trace!(local = %self.local, peer = %source, bytes = n, "datagram");
                    let connection = self.connection_for(source);
                    connection.mark_received();
                    self.sink
                        .deliver(Bytes::copy_from_slice(message), &connection, ctx);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep listening
                    warn!(local = %self.local, error = %e, "udp receive error");
                    break;
                }
            }
        }
        Rearm::Watch(Interest::READABLE)
    }

    fn handle_abort(&self, reason: &str) {
        debug!(local = %self.local, reason, "datagram handler aborted");
    }

    /// Sheds what is waiting on the socket and keeps listening
    fn handle_discard(&self) -> Rearm {
        let mut buf = vec![0u8; self.max_packet + 1];
        let mut shed = 0;
        while shed < DISCARD_DRAIN_LIMIT {
            match self.socket.recv_from(&mut buf) {
                Ok(_) => shed += 1,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        warn!(local = %self.local, shed, "IO queue full; datagrams dropped");
        Rearm::Watch(Interest::READABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscardPolicy, QueueConfig};
    use crate::queue::WorkQueue;
    use crate::reactor::ReactorHandle;
    use crate::transport::{MessageSink, SinkSlot};
    use parking_lot::Mutex;
    use serial_test::serial;
    use std::sync::mpsc;
    use std::thread;

    struct Arrivals(Mutex<mpsc::Sender<(SocketAddr, Vec<u8>)>>);

    impl MessageSink for Arrivals {
        fn on_message(&self, message: Bytes, connection: &Arc<Connection>, _ctx: &WorkerContext) {
            let _ = self.0.lock().send((connection.local_addr(), message.to_vec()));
        }
    }

    fn listen(
        reactor: &ReactorHandle,
        table: &Arc<ConnectionTable>,
        sink: &SinkSlot,
    ) -> SocketAddr {
        let socket = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).unwrap());
        let handler = DatagramHandler::new(
            socket.clone(),
            Transport::Udp,
            table.clone(),
            sink.clone(),
            65535,
            Duration::from_secs(300),
        )
        .unwrap();
        let local = handler.local;
        reactor.register(socket, Arc::new(handler), Interest::READABLE).unwrap();
        local
    }

    fn wait_until(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    #[serial]
    fn listener_survives_a_discarded_readiness_event() {
        let queue = WorkQueue::new(
            &QueueConfig::new("IO_SMALL")
                .with_max_size(1)
                .with_max_threads(1)
                .with_discard_policy(DiscardPolicy::DiscardNewest),
        )
        .unwrap();
        let reactor = ReactorHandle::start(queue.clone()).unwrap();
        let table = Arc::new(ConnectionTable::new(64, true));
        let sink = SinkSlot::default();
        let (tx, rx) = mpsc::channel();
        sink.set(Arc::new(Arrivals(Mutex::new(tx))));

        let a = listen(&reactor, &table, &sink);
        let b = listen(&reactor, &table, &sink);
        wait_until("both registrations", || reactor.registered() == 2);

        // workers are not running yet: A's readiness fills the queue, B's is dropped
        let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"to-a", a).unwrap();
        wait_until("A queued", || queue.len() == 1);
        peer.send_to(b"to-b", b).unwrap();
        wait_until("B discarded", || queue.dropped() == 1);
        assert_eq!(reactor.registered(), 2);

        queue.start().unwrap();
        let (local, body) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((local, body.as_slice()), (a, &b"to-a"[..]));

        peer.send_to(b"to-b again", b).unwrap();
        let (local, body) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((local, body.as_slice()), (b, &b"to-b again"[..]));

        reactor.shutdown();
        queue.shutdown();
    }

    #[test]
    fn pool_hands_each_worker_its_own_socket() {
        let pool = UdpSocketPool::bind(3, "127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(pool.len(), 3);
        let a = pool.for_worker(0).local_addr().unwrap();
        let b = pool.for_worker(1).local_addr().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.for_worker(3).local_addr().unwrap(), a);
    }

    #[test]
    fn full_socket_buffer_gives_up_after_the_deadline() {
        let started = Instant::now();
        let result = retry_until(Duration::from_millis(20), || {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        });
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert!(started.elapsed() >= Duration::from_millis(20));

        let mut attempts = 0;
        let result = retry_until(Duration::from_secs(1), || {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn link_sends_to_bound_peer() {
        let receiver = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let socket = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).unwrap());
        let link = UdpLink::new(socket.clone(), receiver.local_addr().unwrap());
        assert_eq!(link.local_addr(), socket.local_addr().ok());
        link.send(b"OPTIONS").unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OPTIONS");
        assert_eq!(from, socket.local_addr().unwrap());
    }
}
