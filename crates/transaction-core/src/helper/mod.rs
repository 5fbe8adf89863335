//! Request interfaces that sit between the manager and the TU.
//!
//! [`RequestQueueHelper`] moves request handling onto a bounded
//! [`WorkQueue`]. When the queue overflows, or the helper is flagged as
//! overloaded, the request is handed to a [`DiscardInterface`] instead,
//! usually a [`RejectHelper`] or a [`RedirectHelper`].

mod redirect;
mod reject;

pub use redirect::RedirectHelper;
pub use reject::RejectHelper;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rvoip_sip_transport::{Connection, QueueConfig, UnitOfWork, WorkQueue, WorkerContext};
use tracing::{debug, warn};

use crate::config::RequestQueueConfig;
use crate::error::Result;
use crate::interfaces::{DiscardInterface, RequestInterface};
use crate::message::SipMessage;
use crate::transaction::ServerTransaction;

struct RequestWork {
    tx: ServerTransaction,
    handler: Arc<dyn RequestInterface>,
    discard: Arc<dyn DiscardInterface>,
}

impl UnitOfWork for RequestWork {
    fn run(self: Box<Self>, ctx: &WorkerContext) {
        debug!(id = %self.tx.key(), worker = ctx.worker_id, "dispatching request");
        self.handler.request(self.tx);
    }

    fn abort(self: Box<Self>) {
        self.discard.discard(&self.tx);
    }
}

/// Queues inbound requests for `handler`
pub struct RequestQueueHelper {
    handler: Arc<dyn RequestInterface>,
    discard: Arc<dyn DiscardInterface>,
    queue: Arc<WorkQueue>,
    bypass: bool,
    overloaded: AtomicBool,
}

impl RequestQueueHelper {
    pub fn new(
        config: &RequestQueueConfig,
        handler: Arc<dyn RequestInterface>,
        discard: Arc<dyn DiscardInterface>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = WorkQueue::new(
            &QueueConfig::new(config.name.clone())
                .with_max_size(config.queue_length)
                .with_max_threads(config.workers)
                .with_discard_policy(config.discard_policy),
        )?;
        Ok(Self {
            handler,
            discard,
            queue,
            bypass: config.bypass_queue,
            overloaded: AtomicBool::new(false),
        })
    }

    /// Starts the worker threads
    pub fn start(&self) -> Result<()> {
        self.queue.start()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// While set, every request takes the discard path
    pub fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::Release);
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

impl RequestInterface for RequestQueueHelper {
    fn request(&self, tx: ServerTransaction) {
        let unit = Box::new(RequestWork {
            tx,
            handler: self.handler.clone(),
            discard: self.discard.clone(),
        });
        if self.is_overloaded() {
            unit.abort();
            return;
        }
        if self.bypass {
            let ctx = WorkerContext {
                worker_id: 0,
                queue: Arc::from(self.queue.name()),
            };
            unit.run(&ctx);
            return;
        }
        if let Some(dropped) = self.queue.nqueue(unit) {
            warn!(queue = %self.queue.name(), "queue is full; aborting a unit of work");
            dropped.abort();
        }
    }

    fn cancel(&self, tx: &ServerTransaction, cancel: &SipMessage) {
        self.handler.cancel(tx, cancel);
    }

    fn ack(&self, tx: &ServerTransaction, ack: &SipMessage) {
        self.handler.ack(tx, ack);
    }

    fn timeout(&self, tx: &ServerTransaction) {
        self.handler.timeout(tx);
    }

    fn stray(&self, message: &SipMessage, connection: &Arc<Connection>) {
        self.handler.stray(message, connection);
    }
}

impl Drop for RequestQueueHelper {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}
