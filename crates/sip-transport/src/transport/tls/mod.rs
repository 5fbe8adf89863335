//! TLS over TCP: the engine, certificate loading and the link/reader pair
//! used by TLS connections.

pub mod config;
pub mod engine;

pub use config::{TlsSettings, client_config_from_pem, server_config_from_pem};
pub use engine::{EngineStatus, HandshakeStatus, TlsEngine};

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::binding::TlsSessionInfo;
use crate::connection::Link;
use crate::error::{Error, Result};
use crate::transport::{ReadOutcome, StreamRead};

pub type TcpTlsEngine = TlsEngine<TcpStream>;

/// Engine for an outbound connection to `server_name`
pub fn client_engine(
    stream: Arc<TcpStream>,
    config: Arc<ClientConfig>,
    server_name: &str,
    handshake_timeout: Duration,
) -> Result<Arc<TcpTlsEngine>> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::TlsCertificateError(format!("{}: {}", server_name, e)))?;
    let conn = ClientConnection::new(config, name)?;
    Ok(Arc::new(TlsEngine::new(stream, conn, handshake_timeout)))
}

/// Engine for an accepted connection
pub fn server_engine(
    stream: Arc<TcpStream>,
    config: Arc<ServerConfig>,
    handshake_timeout: Duration,
) -> Result<Arc<TcpTlsEngine>> {
    let conn = ServerConnection::new(config)?;
    Ok(Arc::new(TlsEngine::new(stream, conn, handshake_timeout)))
}

/// Sends through the engine
pub struct TlsLink {
    engine: Arc<TcpTlsEngine>,
}

impl TlsLink {
    pub fn new(engine: Arc<TcpTlsEngine>) -> Self {
        Self { engine }
    }
}

fn to_io(error: Error) -> io::Error {
    match error {
        Error::IoError(e) | Error::SendFailed(_, e) | Error::ReceiveFailed(e) => e,
        Error::TlsPeerClosed | Error::TransportClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, error.to_string())
        }
        other => io::Error::other(other.to_string()),
    }
}

impl Link for TlsLink {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.engine.write(buf).map_err(to_io)
    }

    fn send_to(&self, buf: &[u8], _dest: SocketAddr) -> io::Result<usize> {
        self.send(buf)
    }

    fn close(&self) -> io::Result<()> {
        let notify = self.engine.close_outbound().map_err(to_io);
        let shutdown = match self.engine.channel().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        };
        notify.and(shutdown)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.channel().local_addr().ok()
    }
}

/// Reads plaintext out of the engine
pub struct TlsReader(pub Arc<TcpTlsEngine>);

impl StreamRead for TlsReader {
    fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.0.read(buf)
    }

    fn session(&self) -> Option<Arc<TlsSessionInfo>> {
        self.0.session()
    }
}
