//! Retry and timeout policy.
//!
//! `RetryPolicy` carries every bound the session waits under.
//! `StartHandshake` applies the start-phase rule: wait for XON, tolerate
//! XOFF and stray notifications, give up after `max_start_retries` timeouts.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::protocol::{StatusCode, StatusNotification};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_start_retries: u32,
    pub status_timeout: Duration,
    pub control_timeout: Duration,
    pub write_timeout: Duration,
    pub pacing_delay: Duration,
    pub write_backoff: Duration,
    pub pause_poll: Duration,
    pub max_consecutive_write_timeouts: u32,
    pub max_resync_attempts: u32,
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_start_retries: config.max_start_retries,
            status_timeout: Duration::from_millis(config.status_timeout_ms),
            control_timeout: Duration::from_millis(config.control_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            pacing_delay: Duration::from_millis(config.pacing_delay_ms),
            write_backoff: Duration::from_millis(config.write_backoff_ms),
            pause_poll: Duration::from_millis(config.pause_poll_ms),
            max_consecutive_write_timeouts: config.max_consecutive_write_timeouts,
            max_resync_attempts: config.max_resync_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl RetryPolicy {
    /// Whether `count` timed-out writes in a row exceeds the budget.
    /// A zero budget retries forever.
    pub fn write_timeouts_exhausted(&self, count: u32) -> bool {
        self.max_consecutive_write_timeouts != 0 && count > self.max_consecutive_write_timeouts
    }
}

/// Input to the start handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    Status(StatusNotification),
    /// A notification that failed to parse.
    Malformed,
    /// One per-attempt wait elapsed.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Keep waiting.
    Waiting,
    /// XON observed, transfer may begin.
    Ready,
    /// Peer reported a failure code.
    PeerError(StatusCode),
    /// All attempts timed out.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartHandshake {
    max_retries: u32,
    timeouts: u32,
    waits: u32,
}

impl StartHandshake {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            timeouts: 0,
            waits: 0,
        }
    }

    /// Timeouts seen so far.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Notifications that neither completed nor failed the handshake.
    pub fn waits(&self) -> u32 {
        self.waits
    }

    pub fn on_event(&mut self, event: HandshakeEvent) -> HandshakeStep {
        match event {
            HandshakeEvent::Status(status) => match status.code {
                StatusCode::Xon => {
                    info!("Received XON status notification, continuing");
                    HandshakeStep::Ready
                }
                StatusCode::Xoff => {
                    info!("Received XOFF status notification");
                    self.waits += 1;
                    HandshakeStep::Waiting
                }
                code if code.is_peer_error() => {
                    self.waits += 1;
                    HandshakeStep::PeerError(code)
                }
                code => {
                    warn!(status = %code, "Unexpected status notification while starting");
                    self.waits += 1;
                    HandshakeStep::Waiting
                }
            },
            HandshakeEvent::Malformed => {
                self.waits += 1;
                HandshakeStep::Waiting
            }
            HandshakeEvent::Timeout => {
                self.timeouts += 1;
                info!(
                    attempt = self.timeouts,
                    max = self.max_retries,
                    "Waiting for status notification timed out"
                );
                if self.timeouts >= self.max_retries {
                    HandshakeStep::Exhausted {
                        attempts: self.timeouts,
                    }
                } else {
                    HandshakeStep::Waiting
                }
            }
        }
    }
}
