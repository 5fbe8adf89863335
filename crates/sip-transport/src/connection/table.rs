use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::Connection;
use crate::binding::{BindingInfo, Transport};

/// Five-tuple identifying a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub transport: Transport,
}

impl ConnectionKey {
    pub fn new(local: SocketAddr, remote: SocketAddr, transport: Transport) -> Self {
        Self {
            local,
            remote,
            transport,
        }
    }
}

impl From<&BindingInfo> for ConnectionKey {
    fn from(binding: &BindingInfo) -> Self {
        Self::new(binding.local, binding.remote, binding.transport)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.transport, self.local, self.remote)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    udp: usize,
    tcp: usize,
    tls: usize,
    multicast: usize,
}

impl Counts {
    fn slot(&mut self, transport: Transport) -> &mut usize {
        match transport {
            Transport::Udp => &mut self.udp,
            Transport::Tcp => &mut self.tcp,
            Transport::Tls => &mut self.tls,
            Transport::Multicast => &mut self.multicast,
        }
    }

    fn streams(&self) -> usize {
        self.tcp + self.tls
    }
}

/// Owns every live connection, keyed by five-tuple
///
/// Stream listeners are paused once the TCP + TLS count reaches
/// `max_connections` and resumed when it falls below again.
pub struct ConnectionTable {
    connections: DashMap<ConnectionKey, Arc<Connection>>,
    by_remote: DashMap<(SocketAddr, Transport), ConnectionKey>,
    counts: Mutex<Counts>,
    max_connections: AtomicUsize,
    accepting_streams: AtomicBool,
    cleanup_interval: Mutex<Duration>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionTable {
    const LARGE_CAPACITY: usize = 32768;

    pub fn new(max_connections: usize, small_maps: bool) -> Self {
        let capacity = if small_maps { 8 } else { Self::LARGE_CAPACITY };
        Self {
            connections: DashMap::with_capacity(capacity),
            by_remote: DashMap::with_capacity(capacity),
            counts: Mutex::new(Counts::default()),
            max_connections: AtomicUsize::new(max_connections),
            accepting_streams: AtomicBool::new(true),
            cleanup_interval: Mutex::new(Duration::from_secs(60)),
            sweeper: Mutex::new(None),
        }
    }

    /// Exact five-tuple lookup
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.get(key).map(|c| c.value().clone())
    }

    /// Lookup ignoring the local side
    pub fn find(&self, remote: SocketAddr, transport: Transport) -> Option<Arc<Connection>> {
        let key = *self.by_remote.get(&(remote, transport))?.value();
        self.get(&key)
    }

    /// Returns a usable connection, including one still connecting
    pub fn find_active_or_connecting(
        &self,
        remote: SocketAddr,
        transport: Transport,
    ) -> Option<Arc<Connection>> {
        self.find(remote, transport).filter(|c| !c.is_shutdown())
    }

    pub fn put(&self, connection: Arc<Connection>) {
        let key = connection.key();
        debug!(key = %key, conn = connection.id(), "add connection");
        let mut counts = self.counts.lock();
        let previous = self.connections.insert(key, connection);
        self.by_remote.insert((key.remote, key.transport), key);
        if previous.is_none() {
            *counts.slot(key.transport) += 1;
        }
        let max = self.max_connections.load(Ordering::Acquire);
        if counts.streams() >= max && self.accepting_streams.swap(false, Ordering::AcqRel) {
            info!(
                streams = counts.streams(),
                max, "connection limit reached, pausing stream listeners"
            );
        }
    }

    /// Removes `connection`; closes its socket unless `keep_open`
    ///
    /// Removing a connection that is not in the table is a no-op apart from
    /// the optional close.
    pub fn remove(&self, connection: &Connection, keep_open: bool) -> bool {
        let key = connection.key();
        let removed = {
            let mut counts = self.counts.lock();
            match self.connections.remove_if(&key, |_, c| c.id() == connection.id()) {
                Some(_) => {
                    self.by_remote
                        .remove_if(&(key.remote, key.transport), |_, k| *k == key);
                    let slot = counts.slot(key.transport);
                    *slot = slot.saturating_sub(1);
                    true
                }
                None => {
                    trace!(key = %key, "remove: connection not found");
                    false
                }
            }
        };

        if connection.is_connecting() {
            return removed;
        }
        // closing notifies listeners, which may re-enter the table
        if !keep_open {
            self.close_socket(connection);
        }
        let counts = self.counts.lock();
        let max = self.max_connections.load(Ordering::Acquire);
        if counts.streams() < max && !self.accepting_streams.swap(true, Ordering::AcqRel) {
            info!(streams = counts.streams(), max, "resuming stream listeners");
        }
        removed
    }

    pub fn close_socket(&self, connection: &Connection) {
        if let Err(e) = connection.close() {
            debug!(conn = connection.id(), error = %e, "error closing socket");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn count(&self, transport: Transport) -> usize {
        *self.counts.lock().slot(transport)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Acquire)
    }

    pub fn set_max_connections(&self, max: usize) {
        let counts = self.counts.lock();
        self.max_connections.store(max, Ordering::Release);
        let accepting = counts.streams() < max;
        self.accepting_streams.store(accepting, Ordering::Release);
        debug!(streams = counts.streams(), max, accepting, "set_max_connections");
    }

    /// Whether stream listeners should admit new connections
    pub fn accepting_streams(&self) -> bool {
        self.accepting_streams.load(Ordering::Acquire)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Closes and removes every connection whose idle policy allows it
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| e.value().should_close(now))
            .map(|e| e.value().clone())
            .collect();
        for connection in &expired {
            debug!(conn = connection.id(), "sweeping idle connection");
            self.remove(connection, false);
        }
        expired.len()
    }

    pub fn cleanup_interval(&self) -> Duration {
        *self.cleanup_interval.lock()
    }

    /// Starts (or restarts) the periodic sweep on `handle`
    pub fn start_sweeper(self: &Arc<Self>, handle: &Handle, interval: Duration) {
        *self.cleanup_interval.lock() = interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(table) = weak.upgrade() else { break };
                let swept = table.sweep(Instant::now());
                if swept > 0 {
                    debug!(swept, remaining = table.len(), "connection sweep");
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn set_cleanup_interval(self: &Arc<Self>, handle: &Handle, interval: Duration) {
        self.start_sweeper(handle, interval);
    }

    /// Stops the sweep and closes every connection
    pub fn close_all(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        for connection in self.connections() {
            self.remove(&connection, false);
        }
    }

    pub fn counts_by_transport(&self) -> HashMap<Transport, usize> {
        let counts = *self.counts.lock();
        let mut map = HashMap::new();
        map.insert(Transport::Udp, counts.udp);
        map.insert(Transport::Tcp, counts.tcp);
        map.insert(Transport::Tls, counts.tls);
        map.insert(Transport::Multicast, counts.multicast);
        map
    }
}

impl Drop for ConnectionTable {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
        if !self.connections.is_empty() {
            warn!(
                remaining = self.connections.len(),
                "connection table dropped with live connections"
            );
        }
    }
}
