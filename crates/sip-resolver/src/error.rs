use std::time::Duration;

use thiserror::Error;

/// Result type for resolver operations
pub type Result<T> = std::result::Result<T, Error>;

/// DNS failures. The locator records these on the response instead of
/// returning them, so the type is cheap to clone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The lookup itself failed (server failure, refused, network)
    #[error("DNS lookup for {name} failed: {reason}")]
    Dns { name: String, reason: String },

    /// No answer within the configured lookup timeout
    #[error("DNS lookup for {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Resolver could not be built from the system configuration
    #[error("Invalid resolver configuration: {0}")]
    InvalidConfig(String),
}
