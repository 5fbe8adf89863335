//! Client and server transactions.
//!
//! A transaction keeps its state machine behind a mutex and processes each
//! input synchronously: the input is applied, the transition's actions run
//! (sends, timer changes), and any follow-up inputs those actions raise are
//! drained before the lock is released. Notifications for the TU are
//! collected while locked and delivered afterwards.
//!
//! Timers that would fire immediately, which is how reliable transports
//! skip the linger states, are queued as follow-up inputs instead of being
//! scheduled.

pub mod client;
pub mod server;
pub mod timers;

pub use client::ClientTransaction;
pub use server::ServerTransaction;
pub use timers::TimerKind;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rvoip_sip_transport::Connection;
use tokio::runtime::Handle;
use tracing::warn;

use crate::config::TransactionConfig;
use crate::interfaces::RequestInterface;
use crate::key::TransactionKey;
use crate::state::Input;
use crate::table::{TableCapacity, TransactionTable};

pub(crate) use client::ClientInner;
pub(crate) use server::ServerInner;

pub(crate) type Table = TransactionTable<ClientInner, ServerInner>;

/// State shared by the manager and every transaction it creates
pub(crate) struct Shared {
    pub(crate) config: TransactionConfig,
    pub(crate) handle: Handle,
    pub(crate) table: Table,
    pub(crate) request_interface: RwLock<Option<Arc<dyn RequestInterface>>>,
}

impl Shared {
    pub(crate) fn new(config: TransactionConfig, handle: Handle) -> Arc<Self> {
        let table = TransactionTable::new(TableCapacity::new(config.small_maps));
        Arc::new(Self {
            config,
            handle,
            table,
            request_interface: RwLock::new(None),
        })
    }

    pub(crate) fn request_interface(&self) -> Option<Arc<dyn RequestInterface>> {
        self.request_interface.read().clone()
    }
}

/// Follow-up inputs raised while handling one input
pub(crate) type FollowUps = VecDeque<Input>;

/// Sends `bytes`; a failure becomes an `IoException` follow-up
pub(crate) fn transmit(
    key: &TransactionKey,
    connection: &Connection,
    bytes: &[u8],
    follow_ups: &mut FollowUps,
) {
    if let Err(e) = connection.send(bytes) {
        warn!(id = %key, peer = %connection.remote_addr(), error = %e, "transaction send failed");
        follow_ups.push_back(Input::IoException);
    }
}

/// Doubles a retransmission interval, optionally capped
pub(crate) fn backoff(interval: Duration, cap: Option<Duration>) -> Duration {
    let doubled = interval * 2;
    match cap {
        Some(cap) => doubled.min(cap),
        None => doubled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let t1 = Duration::from_millis(500);
        let t2 = Duration::from_secs(4);
        let mut interval = t1;
        let mut seen = Vec::new();
        for _ in 0..5 {
            interval = backoff(interval, Some(t2));
            seen.push(interval.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 4000, 4000]);
        assert_eq!(backoff(t2, None), Duration::from_secs(8));
    }
}
