//! Transport configuration
//!
//! Plain serde structs; loading them from a file is left to the embedding
//! application.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binding::Transport;
use crate::error::{Error, Result};

/// What a work queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the unit of work that has waited longest
    DiscardOldest,
    /// Drop the unit of work being added
    DiscardNewest,
    /// Never drop; the queue grows
    GrowWithoutBound,
}

/// Configuration for a named work queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, used for thread names and logs
    pub name: String,
    /// Maximum number of queued units
    pub max_size: usize,
    /// Number of worker threads
    pub max_threads: usize,
    /// Overflow behaviour
    pub discard_policy: DiscardPolicy,
}

impl QueueConfig {
    pub const DEFAULT_MAX_SIZE: usize = 2000;
    pub const DEFAULT_MAX_THREADS: usize = 4;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_discard_policy(mut self, policy: DiscardPolicy) -> Self {
        self.discard_policy = policy;
        self
    }

    /// Validates sizes; both must be positive
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "queue {} max_size must be > 0",
                self.name
            )));
        }
        if self.max_threads == 0 {
            return Err(Error::InvalidConfig(format!(
                "queue {} max_threads must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "WORK".to_string(),
            max_size: Self::DEFAULT_MAX_SIZE,
            max_threads: Self::DEFAULT_MAX_THREADS,
            discard_policy: DiscardPolicy::DiscardNewest,
        }
    }
}

/// Configuration for the transport runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Seconds an unreferenced connection may stay idle
    pub idle_timeout: u64,
    /// Seconds between connection table sweeps
    pub cleanup_interval: u64,
    /// TCP + TLS connection count at which stream listeners pause
    pub max_connections: usize,
    /// TLS handshake timeout in milliseconds
    pub tls_handshake_timeout_ms: u64,
    /// Largest datagram accepted or sent
    pub max_udp_packet_size: usize,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a failed destination stays in the unreachable table
    pub unreachable_timeout_ms: u64,
    /// Use small initial capacities for internal maps
    pub small_maps: bool,
    /// Sockets in the per-worker UDP send pool; defaults to the IO worker count
    pub udp_pool_workers: Option<usize>,
    /// Work queue fed by the reactor
    pub io_queue: QueueConfig,
}

impl TransportConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// How long a caller waits on another thread's connect to `transport`.
    /// The owner of a TLS connect also runs the handshake.
    pub fn connect_wait(&self, transport: Transport) -> Duration {
        match transport {
            Transport::Tls => self.connect_timeout() + self.tls_handshake_timeout(),
            _ => self.connect_timeout(),
        }
    }

    pub fn unreachable_timeout(&self) -> Duration {
        Duration::from_millis(self.unreachable_timeout_ms)
    }

    pub fn udp_pool_workers(&self) -> usize {
        self.udp_pool_workers
            .unwrap_or(self.io_queue.max_threads)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_udp_packet_size == 0 || self.max_udp_packet_size > 65535 {
            return Err(Error::InvalidConfig(format!(
                "max_udp_packet_size {} out of range",
                self.max_udp_packet_size
            )));
        }
        self.io_queue.validate()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 300,
            cleanup_interval: 60,
            max_connections: 256_000,
            tls_handshake_timeout_ms: 5000,
            max_udp_packet_size: 65535,
            connect_timeout_ms: 5000,
            unreachable_timeout_ms: 300_000,
            small_maps: false,
            udp_pool_workers: None,
            io_queue: QueueConfig::new("IO_WORK")
                .with_discard_policy(DiscardPolicy::GrowWithoutBound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = TransportConfig::default();
        assert_eq!(config.tls_handshake_timeout(), Duration::from_millis(5000));
        assert_eq!(config.io_queue.name, "IO_WORK");
        assert_eq!(config.io_queue.discard_policy, DiscardPolicy::GrowWithoutBound);
        assert_eq!(config.io_queue.max_size, 2000);
        assert_eq!(config.udp_pool_workers(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tls_waiters_allow_for_the_handshake() {
        let config = TransportConfig {
            connect_timeout_ms: 1000,
            tls_handshake_timeout_ms: 3000,
            ..TransportConfig::default()
        };
        assert_eq!(config.connect_wait(Transport::Tcp), Duration::from_secs(1));
        assert_eq!(config.connect_wait(Transport::Tls), Duration::from_secs(4));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"idle_timeout": 5, "io_queue": {"max_threads": 2}}"#).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.io_queue.max_threads, 2);
        assert_eq!(config.cleanup_interval, 60);
    }

    #[test]
    fn zero_sized_queue_is_rejected() {
        let queue = QueueConfig::new("REQUEST").with_max_size(0);
        assert!(matches!(queue.validate(), Err(Error::InvalidConfig(_))));
    }
}
