//! TCP transport: listener setup, outbound connects, the accept handler and
//! the plain stream link.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;

use mio::Interest;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionTable, Link};
use crate::error::{Error, Result};
use crate::queue::WorkerContext;
use crate::reactor::{Readiness, ReadyHandler, Rearm};
use crate::transport::{ReadOutcome, StreamAdopter, StreamRead, write_fully};

const LISTEN_BACKLOG: i32 = 1024;

/// Binds a non-blocking listener with address reuse
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket.bind(&addr.into()).map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| Error::BindFailed(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::BindFailed(addr, e))?;
    let listener: StdTcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// Blocking connect bounded by `timeout`, returning a non-blocking stream
pub fn connect(remote: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = StdTcpStream::connect_timeout(&remote, timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::ConnectionTimeout(remote)
        } else {
            Error::ConnectFailed(remote, e)
        }
    })?;
    stream
        .set_nodelay(true)
        .and_then(|_| stream.set_nonblocking(true))
        .map_err(|e| Error::ConnectFailed(remote, e))?;
    Ok(TcpStream::from_std(stream))
}

/// Plain TCP link
pub struct TcpLink {
    stream: Arc<TcpStream>,
}

impl TcpLink {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }
}

impl Link for TcpLink {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        write_fully(&*self.stream, buf)
    }

    fn send_to(&self, buf: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        self.send(buf)
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }
}

/// Reads plaintext straight from the socket
pub struct TcpReader(pub Arc<TcpStream>);

impl StreamRead for TcpReader {
    fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            match (&*self.0).read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::ReceiveFailed(e)),
            }
        }
    }
}

/// Accepts connections on the reactor thread
///
/// While the connection table is over its limit, new connections are
/// accepted and closed straight away so the backlog does not fill.
pub(crate) struct Acceptor {
    listener: Arc<TcpListener>,
    local: SocketAddr,
    tls: bool,
    table: Arc<ConnectionTable>,
    adopter: Arc<dyn StreamAdopter>,
}

impl Acceptor {
    pub(crate) fn new(
        listener: Arc<TcpListener>,
        tls: bool,
        table: Arc<ConnectionTable>,
        adopter: Arc<dyn StreamAdopter>,
    ) -> Result<Self> {
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            local,
            tls,
            table,
            adopter,
        })
    }
}

impl ReadyHandler for Acceptor {
    fn handle_ready(&self, _ready: Readiness, _ctx: &WorkerContext) -> Rearm {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.table.accepting_streams() {
                        debug!(local = %self.local, %peer, "connection limit reached; refusing");
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(%peer, error = %e, "set_nodelay failed");
                    }
                    debug!(local = %self.local, %peer, tls = self.tls, "accepted");
                    self.adopter.adopt(stream, peer, self.local, self.tls);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(local = %self.local, error = %e, "accept failed");
                    break;
                }
            }
        }
        Rearm::Watch(Interest::READABLE)
    }

    fn runs_inline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn connect_failure_carries_the_peer() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        match connect(addr, Duration::from_millis(500)) {
            Err(Error::ConnectFailed(peer, _)) | Err(Error::ConnectionTimeout(peer)) => {
                assert_eq!(peer, addr)
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn link_and_reader_move_bytes() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = Arc::new(connect(addr, Duration::from_secs(1)).unwrap());
        let link = TcpLink::new(stream.clone());
        let reader = TcpReader(stream);

        let mut accepted = loop {
            match listener.accept() {
                Ok((s, _)) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        link.send(b"INVITE").unwrap();
        accepted.write_all(b"SIP/2.0 100 Trying").unwrap();

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        for _ in 0..200 {
            match reader.read_available(&mut buf).unwrap() {
                ReadOutcome::Data(n) => {
                    got.extend_from_slice(&buf[..n]);
                    break;
                }
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert_eq!(got, b"SIP/2.0 100 Trying");
        link.close().unwrap();
    }
}
