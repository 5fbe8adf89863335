//! # Transaction table
//!
//! Five maps hold the live transactions:
//!
//! | map     | key layout | contents |
//! |---------|------------|----------|
//! | client  | `V-B-N` / `V-BT-N` | client transactions |
//! | server  | `B-N`      | server transactions |
//! | merged  | `V-B-N`    | server transactions sharing a base key with a different Via |
//! | cancel  | `V-B-C`    | CANCEL server transactions |
//! | prack   | `V-B-P`    | PRACK server transactions |
//!
//! The server and merged maps sit behind one lock so the find-or-create of
//! an incoming request (merged lookup, base lookup, Via compare, insert) is
//! one critical section. The other maps are `DashMap`s whose entry API gives
//! the same atomicity per key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::key::{KeyContext, KeyRole, MapKey, TransactionKey};

/// What the table needs to know about a stored transaction
pub trait TableEntry: Send + Sync {
    fn key(&self) -> &TransactionKey;

    /// Stored in the merged map rather than the server map
    fn is_merged(&self) -> bool {
        false
    }
}

/// Initial map capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCapacity {
    pub client: usize,
    pub server: usize,
    pub merged: usize,
    pub cancel: usize,
    pub prack: usize,
}

impl TableCapacity {
    pub fn new(small_maps: bool) -> Self {
        if small_maps {
            Self {
                client: 8,
                server: 8,
                merged: 8,
                cancel: 8,
                prack: 8,
            }
        } else {
            Self {
                client: 32768,
                server: 32768,
                merged: 256,
                cancel: 64,
                prack: 2048,
            }
        }
    }
}

/// Outcome of matching an incoming request against the server maps
#[derive(Debug)]
pub enum ServerLookup<S> {
    /// No transaction existed; this one was created
    Created(Arc<S>),
    /// Same base key and same Via as a live transaction
    Retransmission(Arc<S>),
    /// Same base key, different Via; a new transaction in the merged map
    Merged(Arc<S>),
}

impl<S> ServerLookup<S> {
    pub fn transaction(&self) -> &Arc<S> {
        match self {
            ServerLookup::Created(tx)
            | ServerLookup::Retransmission(tx)
            | ServerLookup::Merged(tx) => tx,
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, ServerLookup::Retransmission(_))
    }
}

/// Point-in-time counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub client: usize,
    pub server: usize,
    pub merged: usize,
    pub cancel: usize,
    pub prack: usize,
    pub total_created: u64,
}

struct ServerMaps<S> {
    server: HashMap<MapKey, Arc<S>>,
    merged: HashMap<MapKey, Arc<S>>,
}

pub struct TransactionTable<C, S> {
    client: DashMap<MapKey, Arc<C>>,
    server: Mutex<ServerMaps<S>>,
    cancel: DashMap<MapKey, Arc<S>>,
    prack: DashMap<MapKey, Arc<S>>,
    total_created: AtomicU64,
}

impl<C: TableEntry, S: TableEntry> TransactionTable<C, S> {
    pub fn new(capacity: TableCapacity) -> Self {
        Self {
            client: DashMap::with_capacity(capacity.client),
            server: Mutex::new(ServerMaps {
                server: HashMap::with_capacity(capacity.server),
                merged: HashMap::with_capacity(capacity.merged),
            }),
            cancel: DashMap::with_capacity(capacity.cancel),
            prack: DashMap::with_capacity(capacity.prack),
            total_created: AtomicU64::new(0),
        }
    }

    fn created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    // --- client side ---

    /// Adds a new client transaction; a live one under the same key is an error
    pub fn add_client(&self, tx: Arc<C>) -> Result<()> {
        let map_key = tx.key().map_key(KeyContext::CLIENT_WITH_TO_TAG);
        match self.client.entry(map_key) {
            Entry::Occupied(_) => Err(Error::DuplicateTransaction(tx.key().clone())),
            Entry::Vacant(slot) => {
                trace!(id = %tx.key(), "client transaction added");
                slot.insert(tx);
                self.created();
                Ok(())
            }
        }
    }

    /// Stores `tx`, returning whatever it displaced
    pub fn replace_client(&self, tx: Arc<C>) -> Option<Arc<C>> {
        let map_key = tx.key().map_key(KeyContext::CLIENT_WITH_TO_TAG);
        self.client.insert(map_key, tx)
    }

    /// Moves the transaction stored under `from` to `to`
    pub fn remap_client(&self, from: &MapKey, to: MapKey) -> bool {
        match self.client.remove(from) {
            Some((_, tx)) => {
                debug!(from = %from, to = %to, "client transaction remapped");
                self.client.insert(to, tx);
                true
            }
            None => false,
        }
    }

    pub fn find_client(&self, key: &TransactionKey) -> Option<Arc<C>> {
        self.client
            .get(&key.map_key(KeyContext::CLIENT_WITH_TO_TAG))
            .map(|e| e.value().clone())
    }

    /// Matches a response: the To-tag key first, then the plain key
    pub fn find_client_for_response(&self, key: &TransactionKey) -> Option<Arc<C>> {
        if key.to_tag.is_some() {
            if let Some(tx) = self.client.get(&key.map_key(KeyContext::CLIENT_WITH_TO_TAG)) {
                return Some(tx.value().clone());
            }
        }
        self.client
            .get(&key.map_key(KeyContext::CLIENT))
            .map(|e| e.value().clone())
    }

    /// Removes `tx` if it is the one stored under its key
    pub fn remove_client(&self, tx: &Arc<C>) -> bool {
        let map_key = tx.key().map_key(KeyContext::CLIENT_WITH_TO_TAG);
        self.client
            .remove_if(&map_key, |_, stored| Arc::ptr_eq(stored, tx))
            .is_some()
    }

    // --- server side ---

    /// Matches an incoming request; `create` builds the transaction when
    /// none matches and is told whether it lands in the merged map
    pub fn find_or_create_server<F>(&self, key: &TransactionKey, create: F) -> ServerLookup<S>
    where
        F: FnOnce(bool) -> Arc<S>,
    {
        let via_key = key.map_key(KeyContext::VIA_INCLUSIVE);
        let base_key = key.map_key(KeyContext::SERVER);

        let mut maps = self.server.lock();
        if let Some(tx) = maps.merged.get(&via_key) {
            return ServerLookup::Retransmission(tx.clone());
        }
        let existing = maps
            .server
            .get(&base_key)
            .map(|tx| (tx.clone(), tx.key().via_equals(key)));
        match existing {
            None => {
                let tx = create(false);
                maps.server.insert(base_key, tx.clone());
                drop(maps);
                self.created();
                ServerLookup::Created(tx)
            }
            Some((existing, true)) => ServerLookup::Retransmission(existing),
            Some((_, false)) => {
                debug!(id = %key, "merged request");
                let tx = create(true);
                maps.merged.insert(via_key, tx.clone());
                drop(maps);
                self.created();
                ServerLookup::Merged(tx)
            }
        }
    }

    /// Lookup without creation: merged map, then base map
    pub fn find_server(&self, key: &TransactionKey) -> Option<Arc<S>> {
        let maps = self.server.lock();
        maps.merged
            .get(&key.map_key(KeyContext::VIA_INCLUSIVE))
            .or_else(|| maps.server.get(&key.map_key(KeyContext::SERVER)))
            .cloned()
    }

    fn find_or_create_in<F>(
        &self,
        map: &DashMap<MapKey, Arc<S>>,
        key: &TransactionKey,
        create: F,
    ) -> (Arc<S>, bool)
    where
        F: FnOnce() -> Arc<S>,
    {
        match map.entry(key.map_key(KeyContext::VIA_INCLUSIVE)) {
            Entry::Occupied(found) => (found.get().clone(), false),
            Entry::Vacant(slot) => {
                let tx = create();
                slot.insert(tx.clone());
                self.created();
                (tx, true)
            }
        }
    }

    /// CANCEL server transaction; `true` when it was created
    pub fn find_or_create_cancel<F>(&self, key: &TransactionKey, create: F) -> (Arc<S>, bool)
    where
        F: FnOnce() -> Arc<S>,
    {
        self.find_or_create_in(&self.cancel, key, create)
    }

    /// PRACK server transaction; `true` when it was created
    pub fn find_or_create_prack<F>(&self, key: &TransactionKey, create: F) -> (Arc<S>, bool)
    where
        F: FnOnce() -> Arc<S>,
    {
        self.find_or_create_in(&self.prack, key, create)
    }

    /// Transaction a CANCEL refers to; `None` for a stray CANCEL
    pub fn find_cancel_target(&self, cancel: &TransactionKey) -> Option<Arc<S>> {
        let target = cancel.target_base();
        let maps = self.server.lock();
        if let Some(tx) = maps.merged.get(&target.map_key(KeyContext::VIA_INCLUSIVE)) {
            return Some(tx.clone());
        }
        maps.server
            .get(&target.map_key(KeyContext::SERVER))
            .filter(|tx| tx.key().via_equals(&target))
            .cloned()
    }

    /// INVITE a PRACK acknowledges; `target` comes from the RAck. The PRACK
    /// carries its own branch, so only the sent-by is compared.
    pub fn find_prack_target(&self, target: &TransactionKey) -> Option<Arc<S>> {
        let maps = self.server.lock();
        let merged = maps
            .merged
            .values()
            .find(|tx| tx.key().base_equals(target) && tx.key().sent_by_equals(target));
        if let Some(tx) = merged {
            return Some(tx.clone());
        }
        maps.server
            .get(&target.map_key(KeyContext::SERVER))
            .filter(|tx| tx.key().sent_by_equals(target))
            .cloned()
    }

    /// INVITE transaction an ACK belongs to: merged map, then base map
    pub fn find_ack_target(&self, ack: &TransactionKey) -> Option<Arc<S>> {
        self.find_server(&ack.target_base())
    }

    /// Removes `tx` from whichever map its role and merged flag select.
    /// Removing from the wrong map, or removing twice, does nothing.
    pub fn remove_server(&self, tx: &Arc<S>) -> bool {
        let key = tx.key();
        let removed = match key.role {
            KeyRole::Cancel => self
                .cancel
                .remove_if(&key.map_key(KeyContext::VIA_INCLUSIVE), |_, s| Arc::ptr_eq(s, tx))
                .is_some(),
            KeyRole::Prack => self
                .prack
                .remove_if(&key.map_key(KeyContext::VIA_INCLUSIVE), |_, s| Arc::ptr_eq(s, tx))
                .is_some(),
            KeyRole::Normal | KeyRole::Ack => {
                let mut maps = self.server.lock();
                let (map, map_key) = if tx.is_merged() {
                    (&mut maps.merged, key.map_key(KeyContext::VIA_INCLUSIVE))
                } else {
                    (&mut maps.server, key.map_key(KeyContext::SERVER))
                };
                let same = map.get(&map_key).is_some_and(|stored| Arc::ptr_eq(stored, tx));
                if same {
                    map.remove(&map_key);
                }
                same
            }
        };
        if removed {
            trace!(id = %key, "server transaction removed");
        }
        removed
    }

    // --- counters ---

    pub fn client_count(&self) -> usize {
        self.client.len()
    }

    pub fn server_count(&self) -> usize {
        let maps = self.server.lock();
        maps.server.len() + maps.merged.len() + self.cancel.len() + self.prack.len()
    }

    pub fn len(&self) -> usize {
        self.client_count() + self.server_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let (server, merged) = {
            let maps = self.server.lock();
            (maps.server.len(), maps.merged.len())
        };
        TableSnapshot {
            client: self.client.len(),
            server,
            merged,
            cancel: self.cancel.len(),
            prack: self.prack.len(),
            total_created: self.total_created(),
        }
    }

    /// Drops every transaction and zeroes the counters
    pub fn reset(&self) {
        self.client.clear();
        {
            let mut maps = self.server.lock();
            maps.server.clear();
            maps.merged.clear();
        }
        self.cancel.clear();
        self.prack.clear();
        self.total_created.store(0, Ordering::Relaxed);
    }
}
