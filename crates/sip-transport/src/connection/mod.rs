//! # Connection
//!
//! A single concrete connection type shared by every transport. What differs
//! between UDP, TCP and TLS lives behind the [`Link`] trait; everything else
//! (reference counting, idle policy, send serialization, listeners) is here.
//!
//! ## Lifecycle
//!
//! A connection is created by the runtime on first outbound use or on an
//! inbound accept and stored in the [`ConnectionTable`]. Every consumer holding
//! it calls [`Connection::add_reference`]; when the count drops back to zero the
//! idle clock restarts. The table sweep asks [`Connection::should_close`]:
//! non-persistent connections idle past their timeout are reclaimed, persistent
//! ones invoke their inactivity callback instead and stay open.

mod barrier;
mod table;

pub use barrier::ConnectionBarrier;
pub use table::{ConnectionKey, ConnectionTable};

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, trace, warn};

use crate::binding::{BindingInfo, Transport};
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, ConnectionListener, ListenerSet};

/// Transport capability behind a [`Connection`]
pub trait Link: Send + Sync {
    /// Sends a whole frame to the connected peer
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Sends a frame to an explicit destination (datagram transports)
    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Closes the underlying socket
    fn close(&self) -> io::Result<()>;

    /// Local address of the underlying socket, when known
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Called when a persistent connection has been idle past its timeout
pub type InactivityCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Opaque per-connection application data
pub type AppContext = Arc<dyn Any + Send + Sync>;

/// Guard returned by [`Connection::lock`]; sends are serialized while held
pub struct SendGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    id: u64,
    binding: RwLock<BindingInfo>,
    link: Box<dyn Link>,
    references: AtomicU32,
    last_used: Mutex<Instant>,
    idle_timeout: Mutex<Duration>,
    inactivity: Mutex<Option<InactivityCallback>>,
    connecting: AtomicBool,
    shutdown: AtomicBool,
    send_lock: ReentrantMutex<()>,
    listeners: ListenerSet,
    context: Mutex<Option<AppContext>>,
}

impl Connection {
    pub fn new(binding: BindingInfo, link: Box<dyn Link>, idle_timeout: Duration) -> Self {
        let mut binding = binding;
        if binding.local_is_unspecified() {
            if let Some(local) = link.local_addr() {
                binding.local = local;
            }
        }
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            binding: RwLock::new(binding),
            link,
            references: AtomicU32::new(0),
            last_used: Mutex::new(Instant::now()),
            idle_timeout: Mutex::new(idle_timeout),
            inactivity: Mutex::new(None),
            connecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            send_lock: ReentrantMutex::new(()),
            listeners: ListenerSet::default(),
            context: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the binding
    pub fn binding(&self) -> BindingInfo {
        self.binding.read().clone()
    }

    pub fn update_binding<F: FnOnce(&mut BindingInfo)>(&self, f: F) {
        f(&mut self.binding.write());
    }

    pub fn transport(&self) -> Transport {
        self.binding.read().transport
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.binding.read().remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binding.read().local
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from(&*self.binding.read())
    }

    // --- send path ---

    /// Sends a frame to the connected peer
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        let remote = self.remote_addr();
        self.send_inner(bytes, remote, |link| link.send(bytes))
    }

    /// Sends a frame to an explicit destination
    pub fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize> {
        self.send_inner(bytes, dest, |link| link.send_to(bytes, dest))
    }

    fn send_inner<F>(&self, bytes: &[u8], dest: SocketAddr, op: F) -> Result<usize>
    where
        F: FnOnce(&dyn Link) -> io::Result<usize>,
    {
        if self.is_shutdown() {
            return Err(Error::TransportClosed);
        }
        let stream = self.transport().is_stream();
        let result = if stream {
            let _guard = self.send_lock.lock();
            op(self.link.as_ref())
        } else {
            op(self.link.as_ref())
        };

        match result {
            Ok(n) => {
                trace!(conn = self.id, peer = %dest, bytes = n, "sent");
                self.touch();
                Ok(n)
            }
            Err(e) => {
                debug!(conn = self.id, peer = %dest, error = %e, len = bytes.len(), "send failed");
                if stream {
                    self.listeners
                        .notify(self, &ConnectionEvent::Error(e.to_string()));
                    let _ = self.close();
                }
                Err(Error::SendFailed(dest, e))
            }
        }
    }

    /// Records inbound activity
    pub fn mark_received(&self) {
        self.touch();
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    // --- explicit send lock ---

    /// Blocks until the send lock is held
    pub fn lock(&self) -> SendGuard<'_> {
        SendGuard {
            _guard: self.send_lock.lock(),
        }
    }

    /// Waits at most `timeout` for the send lock
    pub fn try_lock(&self, timeout: Duration) -> Option<SendGuard<'_>> {
        self.send_lock
            .try_lock_for(timeout)
            .map(|guard| SendGuard { _guard: guard })
    }

    // --- references and idle policy ---

    pub fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_reference(&self) {
        let result = self
            .references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match result {
            Ok(1) => self.touch(),
            Ok(_) => {}
            Err(_) => {
                warn!(conn = self.id, "remove_reference below zero; count stays at 0");
                self.touch();
            }
        }
    }

    pub fn references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    pub fn idle_timeout(&self) -> Duration {
        *self.idle_timeout.lock()
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock() = timeout;
    }

    /// Marks the connection persistent; idle expiry then calls `callback`
    pub fn set_persistent(&self, callback: InactivityCallback) {
        *self.inactivity.lock() = Some(callback);
    }

    pub fn clear_persistent(&self) {
        *self.inactivity.lock() = None;
    }

    pub fn is_persistent(&self) -> bool {
        self.inactivity.lock().is_some()
    }

    /// Decides whether the sweep may reclaim this connection
    pub fn should_close(&self, now: Instant) -> bool {
        if self.is_connecting() {
            return false;
        }
        if self.references() > 0 {
            return false;
        }
        let elapsed = now.saturating_duration_since(self.last_used());
        if elapsed <= self.idle_timeout() {
            return false;
        }

        let callback = self.inactivity.lock().clone();
        match callback {
            None => true,
            Some(callback) => {
                debug!(conn = self.id, "persistent connection inactive");
                callback(self);
                *self.last_used.lock() = now;
                false
            }
        }
    }

    // --- flags ---

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.connecting.store(connecting, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // --- application context ---

    pub fn set_context(&self, context: Option<AppContext>) {
        *self.context.lock() = context;
    }

    pub fn context(&self) -> Option<AppContext> {
        self.context.lock().clone()
    }

    // --- listeners ---

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Reports an I/O failure seen outside the send path (e.g. by a reader)
    pub fn report_error(&self, reason: &str) {
        self.listeners
            .notify(self, &ConnectionEvent::Error(reason.to_string()));
    }

    /// Closes the link once; listeners see `Closed`
    pub fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(conn = self.id, binding = %self.binding.read(), "closing connection");
        let result = self.link.close();
        self.listeners.notify(self, &ConnectionEvent::Closed);
        result.map_err(Error::from)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("binding", &*self.binding.read())
            .field("references", &self.references())
            .field("persistent", &self.is_persistent())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// In-process link that records outgoing frames
///
/// Used where no socket is wanted, e.g. when exercising the transaction layer.
#[derive(Default)]
pub struct MemoryLink {
    sent: Mutex<VecDeque<(Option<SocketAddr>, Vec<u8>)>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes subsequent sends fail with `BrokenPipe`
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drains the frames sent so far
    pub fn take_sent(&self) -> Vec<(Option<SocketAddr>, Vec<u8>)> {
        self.sent.lock().drain(..).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn record(&self, dest: Option<SocketAddr>, buf: &[u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link failure"));
        }
        self.sent.lock().push_back((dest, buf.to_vec()));
        Ok(buf.len())
    }
}

impl Link for Arc<MemoryLink> {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.record(None, buf)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.record(Some(dest), buf)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
