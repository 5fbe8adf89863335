//! Socket handlers for each transport.
//!
//! Readiness arrives from the reactor; the handlers here read, frame and
//! hand complete messages to the [`MessageSink`]. Sending goes through the
//! [`Link`](crate::connection::Link) implementations in the submodules.

pub mod tcp;
pub mod tls;
pub mod udp;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Interest;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::binding::TlsSessionInfo;
use crate::connection::{Connection, ConnectionTable};
use crate::error::{Error, Result};
use crate::framing::StreamFramer;
use crate::queue::WorkerContext;
use crate::reactor::{Readiness, ReadyHandler, Rearm};

const READ_CHUNK: usize = 16 * 1024;
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Receives every framed inbound message
pub trait MessageSink: Send + Sync {
    fn on_message(&self, message: Bytes, connection: &Arc<Connection>, ctx: &WorkerContext);
}

/// Shared, late-bound slot holding the sink
#[derive(Clone, Default)]
pub(crate) struct SinkSlot(Arc<RwLock<Option<Arc<dyn MessageSink>>>>);

impl SinkSlot {
    pub(crate) fn set(&self, sink: Arc<dyn MessageSink>) {
        *self.0.write() = Some(sink);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn MessageSink>> {
        self.0.read().clone()
    }

    pub(crate) fn deliver(
        &self,
        message: Bytes,
        connection: &Arc<Connection>,
        ctx: &WorkerContext,
    ) {
        match self.get() {
            Some(sink) => sink.on_message(message, connection, ctx),
            None => debug!(conn = connection.id(), "no message sink; dropping message"),
        }
    }
}

/// Result of one non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Byte source behind a stream connection (plain TCP or TLS)
pub trait StreamRead: Send + Sync {
    fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Session details once a TLS handshake has completed
    fn session(&self) -> Option<Arc<TlsSessionInfo>> {
        None
    }
}

/// Writes all of `buf` to a non-blocking writer
///
/// `WouldBlock` is retried until [`WRITE_DEADLINE`] passes.
pub(crate) fn write_fully<W>(mut writer: W, buf: &[u8]) -> io::Result<usize>
where
    W: Write,
{
    let deadline = Instant::now() + WRITE_DEADLINE;
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "socket not writable"));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Reads, frames and dispatches one stream connection
pub(crate) struct StreamHandler<R> {
    reader: R,
    connection: Arc<Connection>,
    table: Arc<ConnectionTable>,
    sink: SinkSlot,
    framer: Mutex<StreamFramer>,
}

impl<R: StreamRead> StreamHandler<R> {
    pub(crate) fn new(
        reader: R,
        connection: Arc<Connection>,
        table: Arc<ConnectionTable>,
        sink: SinkSlot,
    ) -> Self {
        Self {
            reader,
            connection,
            table,
            sink,
            framer: Mutex::new(StreamFramer::new()),
        }
    }

    fn drop_connection(&self, reason: Option<&str>) -> Rearm {
        if let Some(reason) = reason {
            self.connection.report_error(reason);
        }
        self.table.remove(&self.connection, false);
        Rearm::Remove
    }

    fn dispatch(&self, frame: Bytes, ctx: &WorkerContext) {
        self.sink.deliver(frame, &self.connection, ctx);
    }
}

impl<R: StreamRead> ReadyHandler for StreamHandler<R> {
    fn handle_ready(&self, ready: Readiness, ctx: &WorkerContext) -> Rearm {
        if self.connection.is_shutdown() {
            return self.drop_connection(None);
        }
        if ready.error {
            trace!(conn = self.connection.id(), "error readiness; reading to surface it");
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.reader.read_available(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    self.connection.mark_received();
                    let mut framer = self.framer.lock();
                    framer.push(&buf[..n]);
                    loop {
                        match framer.next_frame() {
                            Ok(Some(frame)) => self.dispatch(frame, ctx),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(conn = self.connection.id(), error = %e, "framing error");
                                drop(framer);
                                return self.drop_connection(Some(&e.to_string()));
                            }
                        }
                    }
                }
                Ok(ReadOutcome::WouldBlock) => break,
                Ok(ReadOutcome::Eof) | Err(Error::TlsPeerClosed) => {
                    debug!(
                        conn = self.connection.id(),
                        peer = %self.connection.remote_addr(),
                        "peer closed"
                    );
                    return self.drop_connection(None);
                }
                Err(e) => {
                    debug!(conn = self.connection.id(), error = %e, "read failed");
                    return self.drop_connection(Some(&e.to_string()));
                }
            }
        }

        if let Some(session) = self.reader.session() {
            if self.connection.binding().tls_session.is_none() {
                self.connection
                    .update_binding(|b| b.tls_session = Some(session));
            }
        }
        Rearm::Watch(Interest::READABLE)
    }

    fn handle_abort(&self, reason: &str) {
        debug!(conn = self.connection.id(), reason, "stream handler aborted");
        self.table.remove(&self.connection, false);
    }
}

/// Hands accepted streams to whoever builds connections for them
pub trait StreamAdopter: Send + Sync {
    fn adopt(&self, stream: mio::net::TcpStream, peer: SocketAddr, local: SocketAddr, tls: bool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(Mutex<VecDeque<Result<Vec<u8>>>>);

    impl StreamRead for Scripted {
        fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
            match self.0.lock().pop_front() {
                None => Ok(ReadOutcome::WouldBlock),
                Some(Ok(data)) if data.is_empty() => Ok(ReadOutcome::Eof),
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(ReadOutcome::Data(data.len()))
                }
                Some(Err(e)) => Err(e),
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Bytes>>);

    impl MessageSink for Collect {
        fn on_message(&self, message: Bytes, _connection: &Arc<Connection>, _ctx: &WorkerContext) {
            self.0.lock().push(message);
        }
    }

    fn setup(
        script: Vec<Result<Vec<u8>>>,
    ) -> (StreamHandler<Scripted>, Arc<Collect>, Arc<ConnectionTable>) {
        use crate::binding::{BindingInfo, Transport};
        use crate::connection::MemoryLink;
        let table = Arc::new(ConnectionTable::new(10, true));
        let conn = Arc::new(Connection::new(
            BindingInfo::new(
                "127.0.0.1:5060".parse().unwrap(),
                "127.0.0.1:7000".parse().unwrap(),
                Transport::Tcp,
            ),
            Box::new(MemoryLink::new()),
            Duration::from_secs(30),
        ));
        table.put(conn.clone());
        let sink = Arc::new(Collect::default());
        let slot = SinkSlot::default();
        slot.set(sink.clone());
        let handler = StreamHandler::new(
            Scripted(Mutex::new(script.into())),
            conn,
            table.clone(),
            slot,
        );
        (handler, sink, table)
    }

    fn ctx() -> WorkerContext {
        WorkerContext {
            worker_id: 0,
            queue: Arc::from("TEST"),
        }
    }

    #[test]
    fn frames_are_dispatched_and_source_rearmed() {
        let (handler, sink, _) = setup(vec![
            Ok(b"BYE sip:a SIP/2.0\r\nContent-".to_vec()),
            Ok(b"Length: 0\r\n\r\n".to_vec()),
        ]);
        let rearm = handler.handle_ready(Readiness::default(), &ctx());
        assert_eq!(rearm, Rearm::Watch(Interest::READABLE));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn eof_removes_connection() {
        let (handler, _, table) = setup(vec![Ok(Vec::new())]);
        assert_eq!(handler.handle_ready(Readiness::default(), &ctx()), Rearm::Remove);
        assert!(table.is_empty());
        assert!(handler.connection.is_shutdown());
    }

    #[test]
    fn read_error_removes_connection() {
        let (handler, _, table) = setup(vec![Err(Error::TransportClosed)]);
        assert_eq!(handler.handle_ready(Readiness::default(), &ctx()), Rearm::Remove);
        assert!(table.is_empty());
    }
}
