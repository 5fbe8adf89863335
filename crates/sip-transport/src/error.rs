use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::binding::Transport;

/// Result type for SIP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SIP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to bind to the specified address
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to connect to the specified address
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, io::Error),

    /// Failed to send message to the specified address
    #[error("Failed to send message to {0}: {1}")]
    SendFailed(SocketAddr, io::Error),

    /// Failed to receive message
    #[error("Failed to receive message: {0}")]
    ReceiveFailed(io::Error),

    /// Connection is closed or shutting down
    #[error("Transport closed")]
    TransportClosed,

    /// Connection closed by peer
    #[error("Connection closed by peer: {0}")]
    ConnectionClosedByPeer(SocketAddr),

    /// Connection attempt did not complete in time
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(SocketAddr),

    /// Destination was recently marked unreachable
    #[error("Destination unreachable: {0} ({1})")]
    Unreachable(SocketAddr, Transport),

    /// The peer closed the TLS session while data was expected
    #[error("Remote peer closed the connection")]
    TlsPeerClosed,

    /// The TLS handshake did not finish within the configured timeout
    #[error("TLS handshake timeout after {0} ms")]
    TlsHandshakeTimeout(u64),

    /// The TLS handshake failed before completing
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Ciphertext could not be flushed and nothing was written
    #[error("TLS send buffer full")]
    TlsSendBufferFull,

    /// TLS protocol error reported by rustls
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// TLS certificate or key material could not be loaded
    #[error("TLS certificate error: {0}")]
    TlsCertificateError(String),

    /// Message too large for transport
    #[error("Message too large for transport ({0} bytes)")]
    MessageTooLarge(usize),

    /// Operation not available for this transport
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Stream listeners are paused because the connection limit was reached
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The reactor thread is gone
    #[error("Reactor stopped")]
    ReactorStopped,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl Error {
    /// Returns true for errors that mean the connection can no longer be used
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed
                | Error::ConnectionClosedByPeer(_)
                | Error::TlsPeerClosed
                | Error::TlsHandshakeTimeout(_)
                | Error::TlsHandshakeFailed(_)
                | Error::Tls(_)
                | Error::SendFailed(..)
        )
    }
}
