//! # TLS Engine
//!
//! Drives a `rustls` connection over a non-blocking byte channel using four
//! buffers:
//!
//! - `net_recv`: ciphertext read from the channel, not yet consumed
//! - `app_recv`: plaintext decrypted, not yet handed to the reader
//! - `app_send`: plaintext handed to [`TlsEngine::write`] (fed to rustls)
//! - `net_send`: ciphertext produced, not yet flushed to the channel
//!
//! The inbound side (`net_recv`, `app_recv`) and the outbound side
//! (`net_send`) have separate locks so a read burst and a write burst do not
//! wait on each other. When both are needed they are taken inbound first,
//! then outbound, then the rustls connection. The write path never takes
//! the inbound lock.
//!
//! A caller that starts a handshake waits for it on a oneshot channel with
//! a timeout; the handshake itself is driven by whoever reads the channel.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use rustls::Connection;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::binding::TlsSessionInfo;
use crate::error::{Error, Result};
use crate::transport::ReadOutcome;

const NET_CHUNK: usize = 16 * 1024 + 256;
const APP_RECV_CAPACITY: usize = 64 * 1024;
const FLUSH_DEADLINE: Duration = Duration::from_secs(2);

/// Outcome of one unwrap (decrypt) step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// More ciphertext is needed
    BufferUnderflow,
    /// `app_recv` is full; drain it and retry
    BufferOverflow,
    /// The peer sent close_notify
    Closed,
}

/// Where the handshake stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The handshake completed since the last check
    Finished,
    /// Buffered ciphertext must be processed
    NeedTask,
    NeedWrap,
    NeedUnwrap,
}

struct Inbound {
    net_recv: Vec<u8>,
    app_recv: BytesMut,
    input_closed: bool,
}

struct Outbound {
    net_send: Vec<u8>,
    output_closed: bool,
}

type HandshakeOutcome = std::result::Result<(), String>;

/// TLS state machine over channel `S`
pub struct TlsEngine<S> {
    channel: Arc<S>,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    conn: Mutex<Connection>,
    established: AtomicBool,
    notify: Mutex<Option<oneshot::Sender<HandshakeOutcome>>>,
    waiter: Mutex<Option<oneshot::Receiver<HandshakeOutcome>>>,
    session: Mutex<Option<Arc<TlsSessionInfo>>>,
    handshake_timeout: Duration,
}

impl<S> fmt::Debug for TlsEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("established", &self.is_established())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl<S> TlsEngine<S> {
    pub fn channel(&self) -> &Arc<S> {
        &self.channel
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn session(&self) -> Option<Arc<TlsSessionInfo>> {
        self.session.lock().clone()
    }
}

impl<S> TlsEngine<S>
where
    S: Send + Sync,
    for<'a> &'a S: Read + Write,
{
    pub fn new(channel: Arc<S>, conn: impl Into<Connection>, handshake_timeout: Duration) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            channel,
            inbound: Mutex::new(Inbound {
                net_recv: Vec::with_capacity(NET_CHUNK),
                app_recv: BytesMut::with_capacity(APP_RECV_CAPACITY),
                input_closed: false,
            }),
            outbound: Mutex::new(Outbound {
                net_send: Vec::with_capacity(NET_CHUNK),
                output_closed: false,
            }),
            conn: Mutex::new(conn.into()),
            established: AtomicBool::new(false),
            notify: Mutex::new(Some(tx)),
            waiter: Mutex::new(Some(rx)),
            session: Mutex::new(None),
            handshake_timeout,
        }
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        let net_recv_empty = self.inbound.lock().net_recv.is_empty();
        self.status_of(&self.conn.lock(), net_recv_empty)
    }

    fn status_of(&self, conn: &Connection, net_recv_empty: bool) -> HandshakeStatus {
        if !conn.is_handshaking() {
            if self.is_established() {
                HandshakeStatus::NotHandshaking
            } else {
                HandshakeStatus::Finished
            }
        } else if conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if !net_recv_empty {
            HandshakeStatus::NeedTask
        } else {
            HandshakeStatus::NeedUnwrap
        }
    }

    /// Sends whatever the client side has to say first
    pub fn begin_handshake(&self) -> Result<()> {
        let mut inbound = self.inbound.lock();
        self.process_handshake(&mut inbound).map(|_| ())
    }

    /// Waits until the handshake finishes, fails or times out
    pub async fn wait_for_handshake(&self) -> Result<()> {
        if self.is_established() {
            return Ok(());
        }
        let Some(rx) = self.waiter.lock().take() else {
            return Err(Error::TlsHandshakeFailed("handshake already awaited".to_string()));
        };
        match tokio::time::timeout(self.handshake_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(Error::TlsHandshakeFailed(reason)),
            Ok(Err(_)) => Err(Error::TlsPeerClosed),
            Err(_) => Err(Error::TlsHandshakeTimeout(
                self.handshake_timeout.as_millis() as u64,
            )),
        }
    }

    fn signal(&self, outcome: HandshakeOutcome) {
        if let Some(tx) = self.notify.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    fn fail(&self, error: Error) -> Error {
        self.signal(Err(error.to_string()));
        error
    }

    /// Runs the handshake as far as buffered data allows
    ///
    /// Returns true once the handshake is complete.
    fn process_handshake(&self, inbound: &mut Inbound) -> Result<bool> {
        loop {
            let status = self.status_of(&self.conn.lock(), inbound.net_recv.is_empty());
            trace!(?status, "handshake status");
            match status {
                HandshakeStatus::NotHandshaking => return Ok(true),
                HandshakeStatus::Finished => {
                    self.on_established();
                    self.flush_pending()?;
                    return Ok(true);
                }
                HandshakeStatus::NeedTask => {
                    if self.unwrap(inbound).map_err(|e| self.fail(e))? == EngineStatus::Closed {
                        return Err(self.fail(Error::TlsPeerClosed));
                    }
                }
                HandshakeStatus::NeedWrap => {
                    let flushed = self.flush_pending().map_err(|e| self.fail(e))?;
                    if !flushed {
                        return Ok(false);
                    }
                }
                HandshakeStatus::NeedUnwrap => return Ok(false),
            }
        }
    }

    fn on_established(&self) {
        if self.established.swap(true, Ordering::AcqRel) {
            return;
        }
        let info = {
            let conn = self.conn.lock();
            let server_name = match &*conn {
                Connection::Server(server) => server.server_name().map(str::to_string),
                Connection::Client(_) => None,
            };
            TlsSessionInfo {
                protocol_version: conn.protocol_version().map(|v| format!("{:?}", v)),
                cipher_suite: conn
                    .negotiated_cipher_suite()
                    .map(|s| format!("{:?}", s.suite())),
                server_name,
                peer_certificates: conn
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                    .unwrap_or_default(),
            }
        };
        debug!(
            protocol = ?info.protocol_version,
            cipher = ?info.cipher_suite,
            "TLS handshake complete"
        );
        *self.session.lock() = Some(Arc::new(info));
        self.signal(Ok(()));
    }

    /// Decrypts what `net_recv` holds into `app_recv`
    fn unwrap(&self, inbound: &mut Inbound) -> Result<EngineStatus> {
        let mut conn = self.conn.lock();
        let mut consumed = 0;
        if !inbound.net_recv.is_empty() {
            let mut pending = &inbound.net_recv[..];
            consumed = conn.read_tls(&mut pending)?;
            inbound.net_recv.drain(..consumed);
        }
        let state = match conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                // queue the alert for the peer before giving up
                let mut alert = Vec::new();
                let _ = conn.write_tls(&mut alert);
                drop(conn);
                let mut outbound = self.outbound.lock();
                outbound.net_send.extend_from_slice(&alert);
                let _ = self.flush_channel(&mut outbound);
                return Err(Error::Tls(e));
            }
        };

        let mut produced = 0;
        let mut overflow = false;
        let mut closed = state.peer_has_closed();
        let mut chunk = [0u8; 4096];
        loop {
            let room = APP_RECV_CAPACITY.saturating_sub(inbound.app_recv.len());
            if room == 0 {
                overflow = true;
                break;
            }
            let want = room.min(chunk.len());
            match conn.reader().read(&mut chunk[..want]) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    inbound.app_recv.extend_from_slice(&chunk[..n]);
                    produced += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::IoError(e)),
            }
        }

        Ok(if overflow {
            EngineStatus::BufferOverflow
        } else if closed && produced == 0 {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        })
    }

    /// Moves rustls output into `net_send` and flushes it
    ///
    /// Returns false if the channel would not take everything.
    fn flush_pending(&self) -> Result<bool> {
        let mut outbound = self.outbound.lock();
        {
            let mut conn = self.conn.lock();
            while conn.wants_write() {
                if conn.write_tls(&mut outbound.net_send)? == 0 {
                    break;
                }
            }
        }
        self.flush_channel(&mut outbound)?;
        Ok(outbound.net_send.is_empty())
    }

    /// Writes `net_send` to the channel, returning the bytes written
    fn flush_channel(&self, outbound: &mut Outbound) -> Result<usize> {
        let deadline = Instant::now() + FLUSH_DEADLINE;
        let mut written = 0;
        while !outbound.net_send.is_empty() {
            match (&*self.channel).write(&outbound.net_send) {
                Ok(0) => return Err(Error::IoError(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => {
                    outbound.net_send.drain(..n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::IoError(e)),
            }
        }
        Ok(written)
    }

    /// Reads decrypted bytes, driving the handshake as data arrives
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut inbound = self.inbound.lock();
        let mut net = [0u8; NET_CHUNK];
        loop {
            if !inbound.app_recv.is_empty() {
                let n = buf.len().min(inbound.app_recv.len());
                buf[..n].copy_from_slice(&inbound.app_recv[..n]);
                inbound.app_recv.advance(n);
                return Ok(ReadOutcome::Data(n));
            }
            if inbound.input_closed {
                return Err(Error::TlsPeerClosed);
            }

            let status = self.unwrap(&mut inbound).map_err(|e| self.fail(e))?;
            if !self.is_established() {
                self.process_handshake(&mut inbound)?;
            } else {
                // post-handshake messages (tickets, key updates) may need a reply
                self.flush_pending()?;
            }
            match status {
                EngineStatus::Ok | EngineStatus::BufferOverflow => continue,
                EngineStatus::Closed => {
                    debug!("peer sent close_notify");
                    inbound.input_closed = true;
                    if !self.is_established() {
                        return Err(self.fail(Error::TlsPeerClosed));
                    }
                }
                EngineStatus::BufferUnderflow => match (&*self.channel).read(&mut net) {
                    Ok(0) => {
                        inbound.input_closed = true;
                        if !self.is_established() {
                            return Err(self.fail(Error::TlsPeerClosed));
                        }
                    }
                    Ok(n) => inbound.net_recv.extend_from_slice(&net[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::WouldBlock);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(self.fail(Error::ReceiveFailed(e))),
                },
            }
        }
    }

    /// Encrypts and sends all of `data`
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut outbound = self.outbound.lock();
        if outbound.output_closed {
            return Err(Error::TransportClosed);
        }
        let mut offset = 0;
        while offset < data.len() {
            let accepted = {
                let mut conn = self.conn.lock();
                let accepted = conn.writer().write(&data[offset..])?;
                while conn.wants_write() {
                    if conn.write_tls(&mut outbound.net_send)? == 0 {
                        break;
                    }
                }
                accepted
            };
            offset += accepted;
            let flushed = self.flush_channel(&mut outbound)?;
            if accepted == 0 && flushed == 0 {
                warn!(pending = outbound.net_send.len(), "TLS send buffer full");
                return Err(Error::TlsSendBufferFull);
            }
        }
        Ok(data.len())
    }

    /// Sends close_notify; further writes fail
    pub fn close_outbound(&self) -> Result<()> {
        let mut outbound = self.outbound.lock();
        if outbound.output_closed {
            return Ok(());
        }
        outbound.output_closed = true;
        {
            let mut conn = self.conn.lock();
            conn.send_close_notify();
            while conn.wants_write() {
                if conn.write_tls(&mut outbound.net_send)? == 0 {
                    break;
                }
            }
        }
        self.flush_channel(&mut outbound)?;
        self.signal(Err("closed before handshake completed".to_string()));
        Ok(())
    }
}
