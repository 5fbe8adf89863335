//! Connection events and listener registration.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

/// Event delivered to connection listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was closed locally or by the peer
    Closed,
    /// An I/O failure occurred; the connection is about to be closed
    Error(String),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Closed => f.write_str("ConnectionClosed"),
            ConnectionEvent::Error(reason) => write!(f, "ConnectionError({})", reason),
        }
    }
}

/// Receives close/error notifications for a connection
pub trait ConnectionListener: Send + Sync {
    fn on_connection_event(&self, connection: &Connection, event: &ConnectionEvent);
}

/// Listener set that is always notified from a snapshot
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Copies the set under the lock and invokes listeners without it
    pub(crate) fn notify(&self, connection: &Connection, event: &ConnectionEvent) {
        let snapshot: Vec<Arc<dyn ConnectionListener>> = self.listeners.lock().clone();
        for listener in snapshot {
            listener.on_connection_event(connection, event);
        }
    }
}
