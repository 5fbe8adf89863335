//! Destinations that recently failed to connect.
//!
//! Entries expire on their own after the configured timeout; adding an entry
//! that already exists restarts its timer.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::binding::Transport;

type Destination = (IpAddr, u16, Transport);

pub struct UnreachableDestinationTable {
    entries: Mutex<HashMap<Destination, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
    timeout: Duration,
    handle: Handle,
}

impl UnreachableDestinationTable {
    pub fn new(handle: Handle, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            timeout,
            handle,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn add(self: &Arc<Self>, addr: IpAddr, port: u16, transport: Transport) {
        let destination = (addr, port, transport);
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        let expiry = self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = weak.upgrade() {
                let mut entries = table.entries.lock();
                if entries.get(&destination).map(|(g, _)| *g) == Some(generation) {
                    entries.remove(&destination);
                    debug!(%addr, port, %transport, "unreachable entry expired");
                }
            }
        });
        if let Some((_, previous)) = entries.insert(destination, (generation, expiry)) {
            previous.abort();
        }
        debug!(%addr, port, %transport, "destination marked unreachable");
    }

    pub fn contains(&self, addr: IpAddr, port: u16, transport: Transport) -> bool {
        self.entries.lock().contains_key(&(addr, port, transport))
    }

    pub fn remove(&self, addr: IpAddr, port: u16, transport: Transport) -> bool {
        match self.entries.lock().remove(&(addr, port, transport)) {
            Some((_, expiry)) => {
                expiry.abort();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        for (_, (_, expiry)) in self.entries.lock().drain() {
            expiry.abort();
        }
    }
}

impl Drop for UnreachableDestinationTable {
    fn drop(&mut self) {
        for (_, (_, expiry)) in self.entries.get_mut().drain() {
            expiry.abort();
        }
    }
}
