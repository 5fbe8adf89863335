//! Resolver configuration

use std::time::Duration;

use rvoip_sip_transport::Transport;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Transports SRV queries are issued for
    pub supported_transports: Vec<Transport>,
    /// Upper bound for a single SRV or A query, in milliseconds
    pub lookup_timeout_ms: u64,
}

impl ResolverConfig {
    pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 5000;

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn supports(&self, transport: Transport) -> bool {
        self.supported_transports.contains(&transport)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            supported_transports: vec![Transport::Udp, Transport::Tcp, Transport::Tls],
            lookup_timeout_ms: Self::DEFAULT_LOOKUP_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_partial_json() {
        let config = ResolverConfig::default();
        assert!(config.supports(Transport::Tls));
        assert!(!config.supports(Transport::Multicast));
        assert_eq!(config.lookup_timeout(), Duration::from_secs(5));

        let config: ResolverConfig =
            serde_json::from_str(r#"{"supported_transports":["Tcp"]}"#).unwrap();
        assert_eq!(config.supported_transports, vec![Transport::Tcp]);
        assert_eq!(config.lookup_timeout_ms, ResolverConfig::DEFAULT_LOOKUP_TIMEOUT_MS);
    }
}
