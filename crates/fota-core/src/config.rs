//! Session configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FotaError;
use crate::protocol::constants::*;

/// Tunables for a FOTA session and the surrounding update flow.
///
/// Every field has a default so partial TOML files load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Advertised name of the peripheral to update.
    pub device_name: String,
    /// Payload bytes per fragment.
    pub fragment_size: usize,
    /// Start-phase waits for XON before giving up.
    pub max_start_retries: u32,
    /// Per-attempt wait for a status notification.
    pub status_timeout_ms: u64,
    /// Timeout for control point writes.
    pub control_timeout_ms: u64,
    /// Timeout for one binary stream write.
    pub write_timeout_ms: u64,
    /// Delay after each accepted fragment.
    pub pacing_delay_ms: u64,
    /// Delay after a timed-out fragment write.
    pub write_backoff_ms: u64,
    /// Status poll interval while paused by XOFF.
    pub pause_poll_ms: u64,
    /// Timed-out writes in a row before the session fails.
    pub max_consecutive_write_timeouts: u32,
    /// Post-transfer SYNC_LOST recoveries before the session fails.
    pub max_resync_attempts: u32,
    /// Fail on peer error codes instead of logging them.
    pub abort_on_peer_error: bool,
    /// Delay between reconnect attempts after commit.
    pub reconnect_interval_ms: u64,
    /// Reconnect attempts after commit.
    pub reconnect_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            fragment_size: FRAGMENT_SIZE,
            max_start_retries: MAXIMUM_RETRIES,
            status_timeout_ms: STATUS_TIMEOUT_MS,
            control_timeout_ms: CONTROL_TIMEOUT_MS,
            write_timeout_ms: WRITE_TIMEOUT_MS,
            pacing_delay_ms: PACING_DELAY_MS,
            write_backoff_ms: WRITE_BACKOFF_MS,
            pause_poll_ms: PAUSE_POLL_MS,
            max_consecutive_write_timeouts: MAX_CONSECUTIVE_WRITE_TIMEOUTS,
            max_resync_attempts: MAX_RESYNC_ATTEMPTS,
            abort_on_peer_error: false,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            reconnect_retries: RECONNECT_RETRIES,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), FotaError> {
        if self.fragment_size == 0 || self.fragment_size > MAX_FRAGMENT_SIZE {
            return Err(FotaError::Config(format!(
                "fragment_size must be within 1..={MAX_FRAGMENT_SIZE}, got {}",
                self.fragment_size
            )));
        }
        if self.max_start_retries == 0 {
            return Err(FotaError::Config(
                "max_start_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Zero delays and short timeouts, for simulated links.
    pub fn fast() -> Self {
        Self {
            status_timeout_ms: 200,
            control_timeout_ms: 200,
            pacing_delay_ms: 0,
            write_backoff_ms: 0,
            pause_poll_ms: 5,
            reconnect_interval_ms: 10,
            ..Self::default()
        }
    }
}
