//! # Reactor
//!
//! One thread owns the `mio::Poll`. Every registration change requested from
//! another thread is queued as an [`Invocation`] and drained by the reactor
//! thread at the top of each loop iteration, so nothing else ever touches
//! the poller.
//!
//! When a source becomes ready it is deregistered and its handler is queued
//! on the IO [`WorkQueue`]. The worker does the actual I/O and returns a
//! [`Rearm`] telling the reactor whether to watch the source again. Handlers
//! that report [`ReadyHandler::runs_inline`] (listening sockets) are serviced
//! on the reactor thread itself and stay registered.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::queue::{UnitOfWork, WorkQueue, WorkerContext};

const WAKER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 1024;

/// Readiness reported for one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
        }
    }
}

/// What the reactor does with a source after its handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    Watch(Interest),
    Remove,
}

/// Anything the reactor can poll
pub trait Pollable: Send + Sync {
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&self, registry: &Registry) -> io::Result<()>;
}

#[cfg(unix)]
impl<T> Pollable for T
where
    T: std::os::unix::io::AsRawFd + Send + Sync,
{
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut mio::unix::SourceFd(&self.as_raw_fd()), token, interest)
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut mio::unix::SourceFd(&self.as_raw_fd()))
    }
}

/// Per-source callback
pub trait ReadyHandler: Send + Sync {
    fn handle_ready(&self, ready: Readiness, ctx: &WorkerContext) -> Rearm;

    /// Called when the work could not run (queue discarded it, reactor stopped)
    fn handle_abort(&self, reason: &str) {
        let _ = reason;
    }

    /// The IO queue dropped this source's ready work. Connections give the
    /// source up; listeners override this to keep watching it.
    fn handle_discard(&self) -> Rearm {
        self.handle_abort("work discarded");
        Rearm::Remove
    }

    /// Accept-style handlers run on the reactor thread
    fn runs_inline(&self) -> bool {
        false
    }
}

enum Invocation {
    Register {
        token: Token,
        source: Arc<dyn Pollable>,
        handler: Arc<dyn ReadyHandler>,
        interest: Interest,
    },
    Rearm {
        token: Token,
        rearm: Rearm,
    },
    Deregister {
        token: Token,
    },
    Debug,
    Shutdown,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Register { token, interest, .. } => {
                write!(f, "Register({}, {:?})", token.0, interest)
            }
            Invocation::Rearm { token, rearm } => write!(f, "Rearm({}, {:?})", token.0, rearm),
            Invocation::Deregister { token } => write!(f, "Deregister({})", token.0),
            Invocation::Debug => f.write_str("Debug"),
            Invocation::Shutdown => f.write_str("Shutdown"),
        }
    }
}

struct Entry {
    source: Arc<dyn Pollable>,
    handler: Arc<dyn ReadyHandler>,
    interest: Interest,
    armed: bool,
}

struct Shared {
    invocations: Mutex<VecDeque<Invocation>>,
    waker: Waker,
    next_token: AtomicUsize,
    registered: AtomicUsize,
    running: AtomicBool,
    queue: Arc<WorkQueue>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle used to talk to the reactor thread
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("running", &self.is_running())
            .field("registered", &self.registered())
            .finish()
    }
}

impl ReactorHandle {
    /// Starts the reactor thread dispatching to `queue`
    pub fn start(queue: Arc<WorkQueue>) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared {
            invocations: Mutex::new(VecDeque::new()),
            waker,
            next_token: AtomicUsize::new(1),
            registered: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            queue,
            thread: Mutex::new(None),
        });

        let reactor = Reactor {
            poll,
            entries: HashMap::new(),
            handle: ReactorHandle {
                shared: shared.clone(),
            },
        };
        let thread = thread::Builder::new()
            .name("sip-reactor".to_string())
            .spawn(move || reactor.run())?;
        *shared.thread.lock() = Some(thread);
        info!("reactor started");
        Ok(Self { shared })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of sources currently known to the reactor
    pub fn registered(&self) -> usize {
        self.shared.registered.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.shared.queue
    }

    /// Queues a registration; the token is valid immediately
    pub fn register(
        &self,
        source: Arc<dyn Pollable>,
        handler: Arc<dyn ReadyHandler>,
        interest: Interest,
    ) -> Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.invoke(Invocation::Register {
            token,
            source,
            handler,
            interest,
        })?;
        Ok(token)
    }

    /// Re-arms a source after its handler ran
    pub fn rearm(&self, token: Token, rearm: Rearm) -> Result<()> {
        self.invoke(Invocation::Rearm { token, rearm })
    }

    pub fn deregister(&self, token: Token) -> Result<()> {
        self.invoke(Invocation::Deregister { token })
    }

    /// Logs every registered token at debug level
    pub fn debug(&self) -> Result<()> {
        self.invoke(Invocation::Debug)
    }

    /// Stops the reactor thread and waits for it
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.invocations.lock().push_back(Invocation::Shutdown);
        let _ = self.shared.waker.wake();
        let thread = self.shared.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        info!("reactor stopped");
    }

    fn invoke(&self, invocation: Invocation) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ReactorStopped);
        }
        trace!(?invocation, "queue invocation");
        self.shared.invocations.lock().push_back(invocation);
        self.shared.waker.wake()?;
        Ok(())
    }
}

/// Runs a ready handler on a worker, then asks the reactor to re-arm it
struct ReadyWork {
    token: Token,
    ready: Readiness,
    handler: Arc<dyn ReadyHandler>,
    reactor: ReactorHandle,
}

impl UnitOfWork for ReadyWork {
    fn run(self: Box<Self>, ctx: &WorkerContext) {
        let rearm = self.handler.handle_ready(self.ready, ctx);
        if let Err(e) = self.reactor.rearm(self.token, rearm) {
            debug!(token = self.token.0, error = %e, "could not re-arm source");
            self.handler.handle_abort("reactor stopped");
        }
    }

    fn abort(self: Box<Self>) {
        warn!(token = self.token.0, "ready work discarded");
        let rearm = self.handler.handle_discard();
        if let Err(e) = self.reactor.rearm(self.token, rearm) {
            debug!(token = self.token.0, error = %e, "could not re-arm discarded source");
        }
    }
}

struct Reactor {
    poll: Poll,
    entries: HashMap<Token, Entry>,
    handle: ReactorHandle,
}

impl Reactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let inline_ctx = WorkerContext {
            worker_id: 0,
            queue: Arc::from("REACTOR"),
        };

        loop {
            if !self.drain_invocations() {
                break;
            }
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                self.dispatch(token, Readiness::from_event(event), &inline_ctx);
            }
        }

        for (token, entry) in self.entries.drain() {
            let _ = entry.source.deregister(self.poll.registry());
            trace!(token = token.0, "dropping registration at shutdown");
            entry.handler.handle_abort("reactor stopped");
        }
        self.handle.shared.registered.store(0, Ordering::Release);
        self.handle.shared.running.store(false, Ordering::Release);
    }

    fn dispatch(&mut self, token: Token, ready: Readiness, inline_ctx: &WorkerContext) {
        let Some(entry) = self.entries.get_mut(&token) else {
            trace!(token = token.0, "event for unknown token");
            return;
        };

        if entry.handler.runs_inline() {
            let handler = entry.handler.clone();
            let rearm = handler.handle_ready(ready, inline_ctx);
            self.apply_rearm(token, rearm);
            return;
        }

        if !entry.armed {
            return;
        }
        if let Err(e) = entry.source.deregister(self.poll.registry()) {
            // still hand it over so the owner can clean up
            debug!(token = token.0, error = %e, "deregister failed");
        }
        entry.armed = false;
        if ready.error {
            debug!(token = token.0, "error readiness");
        }

        let work = Box::new(ReadyWork {
            token,
            ready,
            handler: entry.handler.clone(),
            reactor: self.handle.clone(),
        });
        if let Some(dropped) = self.handle.shared.queue.nqueue(work) {
            dropped.abort();
        }
    }

    fn apply_rearm(&mut self, token: Token, rearm: Rearm) {
        match rearm {
            Rearm::Remove => self.remove(token),
            Rearm::Watch(interest) => {
                let Some(entry) = self.entries.get_mut(&token) else {
                    return;
                };
                let registry = self.poll.registry();
                let result = if entry.armed {
                    if entry.interest == interest {
                        return;
                    }
                    entry
                        .source
                        .deregister(registry)
                        .and_then(|_| entry.source.register(registry, token, interest))
                } else {
                    entry.source.register(registry, token, interest)
                };
                match result {
                    Ok(()) => {
                        entry.interest = interest;
                        entry.armed = true;
                    }
                    Err(e) => {
                        warn!(token = token.0, error = %e, "re-register failed");
                        let handler = entry.handler.clone();
                        self.remove(token);
                        handler.handle_abort("re-register failed");
                    }
                }
            }
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(entry) = self.entries.remove(&token) {
            if entry.armed {
                let _ = entry.source.deregister(self.poll.registry());
            }
            self.handle
                .shared
                .registered
                .store(self.entries.len(), Ordering::Release);
            trace!(token = token.0, "removed");
        }
    }

    /// Returns false once a shutdown has been drained
    fn drain_invocations(&mut self) -> bool {
        let pending: Vec<Invocation> = self.handle.shared.invocations.lock().drain(..).collect();
        for invocation in pending {
            match invocation {
                Invocation::Register {
                    token,
                    source,
                    handler,
                    interest,
                } => match source.register(self.poll.registry(), token, interest) {
                    Ok(()) => {
                        self.entries.insert(
                            token,
                            Entry {
                                source,
                                handler,
                                interest,
                                armed: true,
                            },
                        );
                        self.handle
                            .shared
                            .registered
                            .store(self.entries.len(), Ordering::Release);
                    }
                    Err(e) => {
                        warn!(token = token.0, error = %e, "register failed");
                        handler.handle_abort("register failed");
                    }
                },
                Invocation::Rearm { token, rearm } => self.apply_rearm(token, rearm),
                Invocation::Deregister { token } => self.remove(token),
                Invocation::Debug => {
                    debug!(registered = self.entries.len(), "reactor registrations");
                    for (token, entry) in &self.entries {
                        debug!(
                            token = token.0,
                            interest = ?entry.interest,
                            armed = entry.armed,
                            inline = entry.handler.runs_inline(),
                            "registration"
                        );
                    }
                }
                Invocation::Shutdown => return false,
            }
        }
        true
    }
}
