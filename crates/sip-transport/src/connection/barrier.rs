use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{Connection, ConnectionTable};
use crate::binding::Transport;
use crate::error::{Error, Result};

type Outcome = std::result::Result<Arc<Connection>, String>;

#[derive(Default)]
struct Attempt {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Attempt {
    fn publish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.done.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.clone()
    }
}

/// Allows at most one connect attempt per destination at a time
///
/// The first caller for a `(remote, transport)` pair runs the connect; later
/// callers block until it finishes and share its outcome.
#[derive(Default)]
pub struct ConnectionBarrier {
    attempts: Mutex<HashMap<(SocketAddr, Transport), Arc<Attempt>>>,
}

/// Publishes a failure if the connecting caller unwinds
struct AttemptGuard<'a> {
    barrier: &'a ConnectionBarrier,
    slot: (SocketAddr, Transport),
    attempt: Arc<Attempt>,
    finished: bool,
}

impl AttemptGuard<'_> {
    fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.barrier.attempts.lock().remove(&self.slot);
        self.attempt.publish(outcome);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.barrier.attempts.lock().remove(&self.slot);
            self.attempt.publish(Err("connect attempt abandoned".to_string()));
        }
    }
}

impl ConnectionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connects currently in flight
    pub fn in_flight(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Returns an existing connection or runs `connect` exactly once
    ///
    /// A successful connection is stored in `table` before waiters wake.
    pub fn connect_to<F>(
        &self,
        table: &ConnectionTable,
        remote: SocketAddr,
        transport: Transport,
        timeout: Duration,
        connect: F,
    ) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Result<Arc<Connection>>,
    {
        if let Some(existing) = table.find_active_or_connecting(remote, transport) {
            return Ok(existing);
        }

        let slot = (remote, transport);
        let (attempt, owner) = {
            let mut attempts = self.attempts.lock();
            if let Some(existing) = table.find_active_or_connecting(remote, transport) {
                return Ok(existing);
            }
            match attempts.get(&slot) {
                Some(attempt) => (attempt.clone(), false),
                None => {
                    let attempt = Arc::new(Attempt::default());
                    attempts.insert(slot, attempt.clone());
                    (attempt, true)
                }
            }
        };

        if !owner {
            trace!(peer = %remote, %transport, "waiting for in-flight connect");
            return match attempt.wait(timeout) {
                Some(Ok(connection)) => Ok(connection),
                Some(Err(reason)) => Err(Error::ConnectFailed(remote, io::Error::other(reason))),
                None => Err(Error::ConnectionTimeout(remote)),
            };
        }

        let guard = AttemptGuard {
            barrier: self,
            slot,
            attempt,
            finished: false,
        };
        debug!(peer = %remote, %transport, "connecting");
        match connect() {
            Ok(connection) => {
                table.put(connection.clone());
                guard.finish(Ok(connection.clone()));
                Ok(connection)
            }
            Err(e) => {
                guard.finish(Err(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::binding::BindingInfo;
    use crate::connection::MemoryLink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn new_conn(remote: SocketAddr) -> Arc<Connection> {
        Arc::new(Connection::new(
            BindingInfo::new("127.0.0.1:5070".parse().unwrap(), remote, Transport::Tcp),
            Box::new(MemoryLink::new()),
            Duration::from_secs(60),
        ))
    }

    #[test]
    #[serial]
    fn concurrent_callers_share_one_connect() {
        let table = Arc::new(ConnectionTable::new(100, true));
        let barrier = Arc::new(ConnectionBarrier::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));
        let remote: SocketAddr = "192.0.2.10:5060".parse().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (table, barrier, connects, start) =
                    (table.clone(), barrier.clone(), connects.clone(), start.clone());
                std::thread::spawn(move || {
                    start.wait();
                    barrier
                        .connect_to(&table, remote, Transport::Tcp, Duration::from_secs(2), || {
                            connects.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(50));
                            Ok(new_conn(remote))
                        })
                        .unwrap()
                        .id()
                })
            })
            .collect();

        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len(), 1);
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn failure_is_shared_and_not_cached() {
        let table = ConnectionTable::new(100, true);
        let barrier = ConnectionBarrier::new();
        let remote: SocketAddr = "192.0.2.11:5060".parse().unwrap();
        let err = barrier
            .connect_to(&table, remote, Transport::Tcp, Duration::from_secs(1), || {
                Err(Error::ConnectFailed(
                    remote,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ))
            })
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(..)));

        let ok = barrier.connect_to(&table, remote, Transport::Tcp, Duration::from_secs(1), || {
            Ok(new_conn(remote))
        });
        assert!(ok.is_ok());
    }

    #[test]
    fn existing_connection_short_circuits() {
        let table = ConnectionTable::new(100, true);
        let remote: SocketAddr = "192.0.2.12:5060".parse().unwrap();
        let existing = new_conn(remote);
        table.put(existing.clone());
        let barrier = ConnectionBarrier::new();
        let found = barrier
            .connect_to(&table, remote, Transport::Tcp, Duration::from_secs(1), || {
                panic!("connect must not run")
            })
            .unwrap();
        assert_eq!(found.id(), existing.id());
    }
}
