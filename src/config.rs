//! Client configuration

use crate::{NatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the gateway client.
///
/// Stored as JSON; missing fields take their defaults.
///
/// # Example
/// ```rust,no_run
/// use upnp_nat::NatConfig;
///
/// let config = NatConfig::load("nat.json").expect("Failed to load");
/// println!("SOAP timeout: {:?}", config.request_timeout());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Timeout budget of every gateway exchange in milliseconds
    pub request_timeout_ms: u64,
    /// Interval between renewal passes in milliseconds
    pub renew_interval_ms: u64,
    /// Delay before the first renewal pass in milliseconds
    pub renew_initial_delay_ms: u64,
    /// Upper bound on adjusted retries of one create request
    pub max_create_retries: u32,
    /// Upper bound on entries read when listing gateway mappings
    pub max_enumerated_entries: u32,
    /// Description used for mappings created without one
    pub default_description: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 4_000,
            renew_interval_ms: 2_000,
            renew_initial_delay_ms: 5_000,
            max_create_retries: 3,
            max_enumerated_entries: 1024,
            default_description: "upnp-nat".to_string(),
        }
    }
}

impl NatConfig {
    /// Load from a JSON file; a missing or empty file yields the defaults
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(NatError::InvalidArgument(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval_ms == 0 {
            return Err(NatError::InvalidArgument(
                "renew_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn renew_initial_delay(&self) -> Duration {
        Duration::from_millis(self.renew_initial_delay_ms)
    }
}
