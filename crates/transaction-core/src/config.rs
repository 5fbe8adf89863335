use std::time::Duration;

use serde::{Deserialize, Serialize};

use rvoip_sip_transport::DiscardPolicy;

use crate::error::{Error, Result};

/// Transaction timer values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// RTT estimate; base of every retransmission interval
    pub t1: u64,
    /// Cap for non-INVITE and response retransmission intervals
    pub t2: u64,
    /// How long the network holds messages
    pub t4: u64,
    /// Upper bound on a transaction's lifetime
    pub tn: u64,
    /// How long a client INVITE may stay in a provisional state
    pub tp: u64,
    /// Delay before a server INVITE sends 100 Trying on its own
    pub trying_delay: u64,
}

impl TimerConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2)
    }

    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4)
    }

    pub fn tn(&self) -> Duration {
        Duration::from_millis(self.tn)
    }

    pub fn tp(&self) -> Duration {
        Duration::from_millis(self.tp)
    }

    pub fn trying_delay(&self) -> Duration {
        Duration::from_millis(self.trying_delay)
    }

    /// 64*T1, the give-up interval for retransmissions
    pub fn t1_expired(&self) -> Duration {
        self.t1() * 64
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: 500,
            t2: 4000,
            t4: 5000,
            tn: 64 * 500,
            tp: 180_000,
            trying_delay: 200,
        }
    }
}

/// Settings for [`RequestQueueHelper`](crate::helper::RequestQueueHelper)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestQueueConfig {
    pub name: String,
    pub workers: usize,
    pub queue_length: usize,
    pub discard_policy: DiscardPolicy,
    /// Run the request interface on the caller's thread
    pub bypass_queue: bool,
}

impl RequestQueueConfig {
    pub const DEFAULT_WORKERS: usize = 20;
    pub const DEFAULT_QUEUE_LENGTH: usize = 2000;

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::QueueConfig(format!(
                "invalid number of workers [{}], should be > 0",
                self.workers
            )));
        }
        if self.queue_length == 0 {
            return Err(Error::QueueConfig(format!(
                "invalid max size [{}], should be > 0",
                self.queue_length
            )));
        }
        if self.discard_policy == DiscardPolicy::GrowWithoutBound {
            return Err(Error::QueueConfig(
                "request queues must discard oldest or newest".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            name: "REQUEST_IN".to_string(),
            workers: Self::DEFAULT_WORKERS,
            queue_length: Self::DEFAULT_QUEUE_LENGTH,
            discard_policy: DiscardPolicy::DiscardNewest,
            bypass_queue: false,
        }
    }
}

/// Settings for the transaction manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub timers: TimerConfig,
    /// Small initial capacities for the transaction maps
    pub small_maps: bool,
    /// Answer a cancelled INVITE with 487 without waiting for the request interface
    pub auto_cancel_response: bool,
}
