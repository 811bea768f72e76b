//! Status monitor: a single-slot, last-value-wins mailbox for status
//! notifications.
//!
//! The link's notification path calls [`StatusMonitor::report`]; the session
//! either polls with [`StatusMonitor::try_take`] or blocks in
//! [`StatusMonitor::await_next`]. A value that is overwritten before being
//! taken is lost. Status is state, not an event log.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::transport::NotificationCallback;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("No status notification within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug, Default)]
struct Slot {
    value: Vec<u8>,
    fresh: bool,
    /// Notifications overwritten before anyone took them.
    dropped: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slot: Mutex<Slot>,
    signal: Condvar,
}

/// Shared handle to the status mailbox.
#[derive(Debug, Clone, Default)]
pub struct StatusMonitor {
    inner: Arc<Inner>,
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `payload` and raise the "new value" flag.
    pub fn report(&self, payload: &[u8]) {
        let mut slot = self.slot();
        if slot.fresh {
            slot.dropped += 1;
            trace!(
                overwritten = ?slot.value,
                "Unread status notification overwritten"
            );
        }
        slot.value = payload.to_vec();
        slot.fresh = true;
        drop(slot);
        self.inner.signal.notify_all();
    }

    /// Callback suitable for `Link::subscribe`.
    pub fn callback(&self) -> NotificationCallback {
        let monitor = self.clone();
        Arc::new(move |payload: &[u8]| monitor.report(payload))
    }

    /// Take the pending value without blocking.
    pub fn try_take(&self) -> Option<Vec<u8>> {
        let mut slot = self.slot();
        if slot.fresh {
            slot.fresh = false;
            Some(slot.value.clone())
        } else {
            None
        }
    }

    /// Block until a new value arrives or `timeout` elapses.
    pub fn await_next(&self, timeout: Duration) -> Result<Vec<u8>, MonitorError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        while !slot.fresh {
            let now = Instant::now();
            if now >= deadline {
                return Err(MonitorError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .inner
                .signal
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
        slot.fresh = false;
        Ok(slot.value.clone())
    }

    /// Whether an unread value is waiting.
    pub fn has_pending(&self) -> bool {
        self.slot().fresh
    }

    /// Most recent value, read or not.
    pub fn latest(&self) -> Vec<u8> {
        self.slot().value.clone()
    }

    /// Count of notifications overwritten before being taken.
    pub fn dropped(&self) -> u64 {
        self.slot().dropped
    }
}
