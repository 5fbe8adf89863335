//! # Transport Runtime
//!
//! Owns every shared transport service: the IO work queue, the reactor, the
//! connection table with its connect barrier, the unreachable-destination
//! table and the per-worker UDP pool. Construct one per process (or per
//! test) and pass it around; there are no globals.
//!
//! `connect` blocks the calling thread. TLS connects additionally wait for
//! the handshake on the runtime's tokio handle, so call them from a worker
//! or a plain thread (or `spawn_blocking`), never from inside an async task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use mio::Interest;
use mio::net::{TcpStream, UdpSocket};
use parking_lot::{Mutex, RwLock};
use rustls::{ClientConfig, ServerConfig};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::binding::{BindingInfo, Transport};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionBarrier, ConnectionTable};
use crate::error::{Error, Result};
use crate::queue::{WorkQueue, WorkerContext};
use crate::reactor::{ReactorHandle, ReadyHandler};
use crate::transport::tcp::{self, Acceptor, TcpLink, TcpReader};
use crate::transport::tls::{self, TlsLink, TlsReader, TlsSettings};
use crate::transport::udp::{self, DatagramHandler, UdpLink, UdpSocketPool};
use crate::transport::{MessageSink, SinkSlot, StreamAdopter, StreamHandler, StreamRead};
use crate::unreachable::UnreachableDestinationTable;

struct UdpListenerEntry {
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    multicast: bool,
}

struct RuntimeInner {
    config: TransportConfig,
    handle: Handle,
    io_queue: Arc<WorkQueue>,
    reactor: ReactorHandle,
    table: Arc<ConnectionTable>,
    barrier: ConnectionBarrier,
    unreachable: Arc<UnreachableDestinationTable>,
    udp_pool: UdpSocketPool,
    udp_listeners: Mutex<Vec<UdpListenerEntry>>,
    stream_listeners: Mutex<Vec<(SocketAddr, Transport)>>,
    sink: SinkSlot,
    tls_server: RwLock<Option<Arc<ServerConfig>>>,
    tls_client: RwLock<Option<Arc<ClientConfig>>>,
}

pub struct TransportRuntime {
    inner: Arc<RuntimeInner>,
}

impl TransportRuntime {
    /// Starts the IO queue, the reactor and the connection sweep
    pub fn new(config: TransportConfig, handle: Handle) -> Result<Self> {
        config.validate()?;
        let io_queue = WorkQueue::new(&config.io_queue)?;
        io_queue.start()?;
        let reactor = ReactorHandle::start(io_queue.clone())?;

        let table = Arc::new(ConnectionTable::new(config.max_connections, config.small_maps));
        table.start_sweeper(&handle, config.cleanup_interval());
        let unreachable =
            UnreachableDestinationTable::new(handle.clone(), config.unreachable_timeout());
        let udp_pool =
            UdpSocketPool::bind(config.udp_pool_workers(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;

        info!(
            io_threads = config.io_queue.max_threads,
            max_connections = config.max_connections,
            "transport runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                handle,
                io_queue,
                reactor,
                table,
                barrier: ConnectionBarrier::new(),
                unreachable,
                udp_pool,
                udp_listeners: Mutex::new(Vec::new()),
                stream_listeners: Mutex::new(Vec::new()),
                sink: SinkSlot::default(),
                tls_server: RwLock::new(None),
                tls_client: RwLock::new(None),
            }),
        })
    }

    /// Installs the receiver of inbound messages
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        self.inner.sink.set(sink);
    }

    pub fn set_tls(&self, server: Option<Arc<ServerConfig>>, client: Option<Arc<ClientConfig>>) {
        *self.inner.tls_server.write() = server;
        *self.inner.tls_client.write() = client;
    }

    pub fn configure_tls(&self, settings: &TlsSettings) -> Result<()> {
        let server = settings.server_config()?;
        let client = settings.client_config()?;
        self.set_tls(server, Some(client));
        Ok(())
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.inner.table
    }

    pub fn unreachable(&self) -> &Arc<UnreachableDestinationTable> {
        &self.inner.unreachable
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.inner.reactor
    }

    pub fn io_queue(&self) -> &Arc<WorkQueue> {
        &self.inner.io_queue
    }

    pub fn udp_pool(&self) -> &UdpSocketPool {
        &self.inner.udp_pool
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    // --- listeners ---

    pub fn listen_udp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Arc::new(udp::bind_udp(addr)?);
        self.register_datagram(socket, Transport::Udp, false)
    }

    pub fn listen_multicast(
        &self,
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
    ) -> Result<SocketAddr> {
        let socket = Arc::new(udp::bind_multicast(group, port, interface)?);
        self.register_datagram(socket, Transport::Multicast, true)
    }

    fn register_datagram(
        &self,
        socket: Arc<UdpSocket>,
        transport: Transport,
        multicast: bool,
    ) -> Result<SocketAddr> {
        let inner = &self.inner;
        let handler = DatagramHandler::new(
            socket.clone(),
            transport,
            inner.table.clone(),
            inner.sink.clone(),
            inner.config.max_udp_packet_size,
            inner.config.idle_timeout(),
        )?;
        let local = socket.local_addr()?;
        inner
            .reactor
            .register(socket.clone(), Arc::new(handler), Interest::READABLE)?;
        inner.udp_listeners.lock().push(UdpListenerEntry {
            local,
            socket,
            multicast,
        });
        info!(%local, %transport, "listening");
        Ok(local)
    }

    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listen_stream(addr, false)
    }

    /// Requires a server config from [`set_tls`](Self::set_tls)
    pub fn listen_tls(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.inner.tls_server.read().is_none() {
            return Err(Error::InvalidConfig("no TLS server certificate configured".to_string()));
        }
        self.listen_stream(addr, true)
    }

    fn listen_stream(&self, addr: SocketAddr, tls: bool) -> Result<SocketAddr> {
        let inner = &self.inner;
        let listener = Arc::new(tcp::bind_listener(addr)?);
        let adopter: Arc<dyn StreamAdopter> = Arc::new(Adopter(Arc::downgrade(inner)));
        let acceptor = Acceptor::new(listener.clone(), tls, inner.table.clone(), adopter)?;
        let local = listener.local_addr()?;
        inner
            .reactor
            .register(listener, Arc::new(acceptor), Interest::READABLE)?;
        let transport = if tls { Transport::Tls } else { Transport::Tcp };
        inner.stream_listeners.lock().push((local, transport));
        info!(%local, %transport, "listening");
        Ok(local)
    }

    /// Addresses of every listener
    pub fn listening(&self) -> Vec<(SocketAddr, Transport)> {
        let mut all: Vec<(SocketAddr, Transport)> = self
            .inner
            .udp_listeners
            .lock()
            .iter()
            .map(|l| {
                let transport = if l.multicast { Transport::Multicast } else { Transport::Udp };
                (l.local, transport)
            })
            .collect();
        all.extend(self.inner.stream_listeners.lock().iter().copied());
        all
    }

    // --- outbound ---

    pub fn connect(&self, remote: SocketAddr, transport: Transport) -> Result<Arc<Connection>> {
        self.connect_named(remote, transport, None)
    }

    /// Connects, using `server_name` for TLS verification when given
    pub fn connect_named(
        &self,
        remote: SocketAddr,
        transport: Transport,
        server_name: Option<&str>,
    ) -> Result<Arc<Connection>> {
        match transport {
            Transport::Udp | Transport::Multicast => {
                Ok(self.datagram_connection(remote, transport))
            }
            Transport::Tcp | Transport::Tls => {
                let inner = &self.inner;
                if inner.unreachable.contains(remote.ip(), remote.port(), transport) {
                    debug!(peer = %remote, %transport, "destination marked unreachable");
                    return Err(Error::Unreachable(remote, transport));
                }
                inner.barrier.connect_to(
                    &inner.table,
                    remote,
                    transport,
                    inner.config.connect_wait(transport),
                    || self.open_stream(remote, transport, server_name),
                )
            }
        }
    }

    /// Connects if needed and sends one message
    pub fn send(&self, bytes: &[u8], remote: SocketAddr, transport: Transport) -> Result<usize> {
        if !transport.is_stream() && bytes.len() > self.inner.config.max_udp_packet_size {
            return Err(Error::MessageTooLarge(bytes.len()));
        }
        self.connect(remote, transport)?.send(bytes)
    }

    /// Sends a datagram from the calling worker's pooled socket
    pub fn send_datagram(
        &self,
        ctx: &WorkerContext,
        bytes: &[u8],
        dest: SocketAddr,
    ) -> Result<usize> {
        if bytes.len() > self.inner.config.max_udp_packet_size {
            return Err(Error::MessageTooLarge(bytes.len()));
        }
        self.inner.udp_pool.send_from_worker(ctx, bytes, dest)
    }

    fn datagram_connection(&self, remote: SocketAddr, transport: Transport) -> Arc<Connection> {
        let inner = &self.inner;
        if let Some(existing) = inner.table.find_active_or_connecting(remote, transport) {
            return existing;
        }
        let socket = inner
            .udp_listeners
            .lock()
            .iter()
            .find(|l| !l.multicast && l.local.is_ipv4() == remote.is_ipv4())
            .map(|l| l.socket.clone())
            .unwrap_or_else(|| inner.udp_pool.next().clone());
        let connection = Arc::new(Connection::new(
            BindingInfo::outbound(remote, transport),
            Box::new(UdpLink::new(socket, remote)),
            inner.config.idle_timeout(),
        ));
        inner.table.put(connection.clone());
        connection
    }

    fn open_stream(
        &self,
        remote: SocketAddr,
        transport: Transport,
        server_name: Option<&str>,
    ) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        let stream = match tcp::connect(remote, inner.config.connect_timeout()) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                warn!(peer = %remote, %transport, error = %e, "connect failed");
                inner.unreachable.add(remote.ip(), remote.port(), transport);
                return Err(e);
            }
        };
        let binding = BindingInfo::outbound(remote, transport);

        if transport == Transport::Tcp {
            let connection = Arc::new(Connection::new(
                binding,
                Box::new(TcpLink::new(stream.clone())),
                inner.config.idle_timeout(),
            ));
            inner.watch_stream(stream.clone(), TcpReader(stream), &connection)?;
            return Ok(connection);
        }

        let client = inner.tls_client.read().clone().ok_or_else(|| {
            Error::InvalidConfig("no TLS client configuration".to_string())
        })?;
        let name = server_name
            .map(str::to_string)
            .unwrap_or_else(|| remote.ip().to_string());
        let handshake_timeout = inner.config.tls_handshake_timeout();
        let engine = tls::client_engine(stream.clone(), client, &name, handshake_timeout)?;
        let connection = Arc::new(Connection::new(
            binding,
            Box::new(TlsLink::new(engine.clone())),
            inner.config.idle_timeout(),
        ));
        connection.set_connecting(true);
        inner.watch_stream(stream, TlsReader(engine.clone()), &connection)?;

        let handshake = engine
            .begin_handshake()
            .and_then(|_| inner.handle.block_on(engine.wait_for_handshake()));
        connection.set_connecting(false);
        if let Err(e) = handshake {
            warn!(peer = %remote, error = %e, "TLS handshake failed");
            let _ = connection.close();
            return Err(e);
        }
        connection.update_binding(|b| b.tls_session = engine.session());
        Ok(connection)
    }

    /// Stops the reactor and workers, then closes every connection
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.reactor.is_running() {
            return;
        }
        info!(connections = inner.table.len(), "transport runtime shutting down");
        inner.reactor.shutdown();
        inner.io_queue.shutdown();
        inner.table.close_all();
        inner.unreachable.clear();
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RuntimeInner {
    fn watch_stream<R>(
        &self,
        stream: Arc<TcpStream>,
        reader: R,
        connection: &Arc<Connection>,
    ) -> Result<()>
    where
        R: StreamRead + 'static,
    {
        let handler: Arc<dyn ReadyHandler> = Arc::new(StreamHandler::new(
            reader,
            connection.clone(),
            self.table.clone(),
            self.sink.clone(),
        ));
        if let Err(e) = self.reactor.register(stream, handler, Interest::READABLE) {
            self.table.remove(connection, false);
            return Err(e);
        }
        Ok(())
    }

    fn adopt_stream(&self, stream: TcpStream, peer: SocketAddr, tls: bool) -> Result<()> {
        let stream = Arc::new(stream);
        let local = stream.local_addr()?;
        let transport = if tls { Transport::Tls } else { Transport::Tcp };
        let binding = BindingInfo::new(local, peer, transport);
        let idle = self.config.idle_timeout();

        if !tls {
            let connection = Arc::new(Connection::new(
                binding,
                Box::new(TcpLink::new(stream.clone())),
                idle,
            ));
            self.table.put(connection.clone());
            return self.watch_stream(stream.clone(), TcpReader(stream), &connection);
        }

        let server = self.tls_server.read().clone().ok_or_else(|| {
            Error::InvalidConfig("no TLS server certificate configured".to_string())
        })?;
        let handshake = self.config.tls_handshake_timeout();
        let engine = tls::server_engine(stream.clone(), server, handshake)?;
        let link = Box::new(TlsLink::new(engine.clone()));
        let connection = Arc::new(Connection::new(binding, link, idle));
        self.table.put(connection.clone());
        self.watch_stream(stream, TlsReader(engine), &connection)
    }
}

/// Builds connections for streams accepted on the reactor thread
struct Adopter(Weak<RuntimeInner>);

impl StreamAdopter for Adopter {
    fn adopt(&self, stream: TcpStream, peer: SocketAddr, local: SocketAddr, tls: bool) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Err(e) = inner.adopt_stream(stream, peer, tls) {
            warn!(%local, %peer, error = %e, "could not adopt accepted stream");
        }
    }
}
