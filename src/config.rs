//! Session configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it wants
//! to change:
//!
//! ```
//! use creature_client::SessionConfig;
//!
//! let config = SessionConfig::from_json_str(r#"{
//!     "address": "https://127.0.0.1:50051",
//!     "default_author": "Mochineko"
//! }"#).unwrap();
//! assert_eq!(config.request_buffer, 64);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CreatureError, Result};

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the outbound write queue.
pub const DEFAULT_REQUEST_BUFFER: usize = 64;

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint, must be `https://...`.
    pub address: String,
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// TCP keepalive in milliseconds.
    pub tcp_keepalive_ms: Option<u64>,
    /// HTTP/2 keepalive ping interval in milliseconds.
    pub http2_keepalive_interval_ms: Option<u64>,
    /// PEM file with the CA that signed the server certificate.
    /// Native roots are used when absent.
    pub ca_certificate: Option<PathBuf>,
    /// TLS server name, defaults to the address host.
    pub domain_name: Option<String>,
    /// Create the channel without dialing. Connection failures then
    /// surface on the first read.
    pub lazy_connect: bool,
    /// Capacity of the outbound write queue.
    pub request_buffer: usize,
    /// Author attached to stimuli that carry none.
    pub default_author: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tcp_keepalive_ms: None,
            http2_keepalive_interval_ms: None,
            ca_certificate: None,
            domain_name: None,
            lazy_connect: false,
            request_buffer: DEFAULT_REQUEST_BUFFER,
            default_author: None,
        }
    }
}

impl SessionConfig {
    /// Defaults with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check ranges. The address is validated separately by `Address::parse`.
    pub fn validate(&self) -> Result<()> {
        if self.request_buffer == 0 {
            return Err(CreatureError::Config(
                "request_buffer must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(CreatureError::Config(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive_ms.map(Duration::from_millis)
    }

    #[inline]
    pub fn http2_keepalive_interval(&self) -> Option<Duration> {
        self.http2_keepalive_interval_ms.map(Duration::from_millis)
    }
}
