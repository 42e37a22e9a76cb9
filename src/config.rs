//! Configuration module for Backhaul
//!
//! The broker takes a small, fixed set of knobs. A JSON file can override
//! the defaults; everything else is compiled in.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default address the broker accepts downstream (worker) connections on.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:9999";

/// How often the reaper sweeps upstream listeners for dead workers.
pub(crate) const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between route-match attempts while a request has no matching worker.
pub(crate) const ROUTE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed retry delay after a transient accept error on a public listener.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff bounds for transient accept errors on the control
/// listener.
pub(crate) const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
pub(crate) const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long to keep trying to find a matching downstream worker for an
    /// inbound HTTP request before answering 404.
    #[serde(rename = "missing_route_timeout_secs", with = "duration_secs")]
    pub missing_route_timeout: Duration,

    /// How long an upstream listener with no remaining workers is kept
    /// around before its public port is released.
    #[serde(rename = "empty_listener_timeout_secs", with = "duration_secs")]
    pub empty_listener_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            missing_route_timeout: Duration::from_secs(30),
            empty_listener_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Serde adapter: durations stored as whole seconds on disk.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
