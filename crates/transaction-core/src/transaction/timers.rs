//! Cancellable per-transaction timers.
//!
//! Each timer is a tokio task sleeping on the runtime the transaction was
//! created on. Restarting a kind aborts the previous task; cancelling a
//! timer that already fired, or was never started, does nothing. A fired
//! timer must [`claim`](Timers::claim) its generation before acting, which
//! filters out a task that woke up just as it was cancelled.

use std::collections::HashMap;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::state::Input;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retransmission
    T1,
    /// 64*T1 give-up
    T1Expired,
    /// Provisional guard (client INVITE)
    Tp,
    /// Automatic 100 Trying (server INVITE)
    TProvisional,
    /// Linger in Completed/Confirmed
    Timeout,
    /// Maximum lifetime
    Tn,
    /// Wait for a final response after CANCEL
    Cancel,
}

impl TimerKind {
    pub fn input(self) -> Input {
        match self {
            TimerKind::T1 => Input::T1,
            TimerKind::T1Expired => Input::T1Expired,
            TimerKind::Tp => Input::Tp,
            TimerKind::TProvisional => Input::TProvisional,
            TimerKind::Timeout => Input::Timeout,
            TimerKind::Tn => Input::Tn,
            TimerKind::Cancel => Input::CancelTimer,
        }
    }
}

pub(crate) struct Timers {
    handle: Handle,
    running: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    generation: u64,
}

impl Timers {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            running: HashMap::new(),
            generation: 0,
        }
    }

    /// (Re)starts `kind`; `fire` receives the generation to claim
    pub(crate) fn start<F>(&mut self, kind: TimerKind, delay: Duration, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation);
        });
        trace!(timer = ?kind, ?delay, "timer started");
        self.running.insert(kind, (generation, task));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.running.remove(&kind) {
            task.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, task)) in self.running.drain() {
            task.abort();
        }
    }

    /// True when `generation` is still the live instance of `kind`
    pub(crate) fn claim(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.running.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.running.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_running(&self, kind: TimerKind) -> bool {
        self.running.contains_key(&kind)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_with_its_generation() {
        let mut timers = Timers::new(Handle::current());
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        timers.start(TimerKind::T1, Duration::from_millis(500), move |generation| {
            seen.store(generation, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let generation = fired.load(Ordering::SeqCst);
        assert_ne!(generation, 0);
        assert!(timers.claim(TimerKind::T1, generation));
        assert!(!timers.claim(TimerKind::T1, generation));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let mut timers = Timers::new(Handle::current());
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        timers.start(TimerKind::Timeout, Duration::from_secs(1), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timers.cancel(TimerKind::Timeout);
        timers.cancel(TimerKind::Timeout);
        timers.cancel(TimerKind::Tn);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timers.is_running(TimerKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_previous_generation() {
        let mut timers = Timers::new(Handle::current());
        timers.start(TimerKind::T1, Duration::from_secs(10), |_| {});
        let fired = Arc::new(AtomicU64::new(0));
        let seen = fired.clone();
        timers.start(TimerKind::T1, Duration::from_secs(1), move |generation| {
            seen.store(generation, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!timers.claim(TimerKind::T1, 1));
        assert!(timers.claim(TimerKind::T1, 2));
    }
}
