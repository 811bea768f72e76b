//! Flow control: XON/XOFF pausing and sync-loss rewinds.

use tracing::{info, warn};

use crate::payload::PacketSequencer;
use crate::protocol::{StatusCode, StatusNotification};

/// Outcome of applying one status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep sending at the current position.
    Continue,
    /// Peer asserted backpressure; rewound to `fragment_id`.
    Paused { fragment_id: u8 },
    /// Peer released backpressure; rewound to `fragment_id`.
    Resumed { fragment_id: u8 },
    /// Peer lost sync; rewound to `fragment_id`, sending continues.
    Resynchronized { fragment_id: u8 },
    /// Peer reported a failure. Sending continues unless the caller aborts.
    PeerError(StatusCode),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowController {
    paused: bool,
}

impl FlowController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sending is forbidden while paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn apply(
        &mut self,
        status: &StatusNotification,
        sequencer: &mut PacketSequencer,
    ) -> Disposition {
        match (status.code, status.fragment_id) {
            (StatusCode::Xoff, Some(fragment_id)) => {
                info!(fragment_id, "XOFF: pausing");
                self.paused = true;
                sequencer.rewind(fragment_id);
                Disposition::Paused { fragment_id }
            }
            (StatusCode::Xon, Some(fragment_id)) => {
                info!(fragment_id, "XON: resuming");
                self.paused = false;
                sequencer.rewind(fragment_id);
                Disposition::Resumed { fragment_id }
            }
            (StatusCode::SyncLost, Some(fragment_id)) => {
                warn!(fragment_id, from = %sequencer, "SYNC_LOST: rewinding");
                sequencer.rewind(fragment_id);
                Disposition::Resynchronized { fragment_id }
            }
            (StatusCode::Ok, _) | (StatusCode::UpdateSuccessful, _) => {
                info!(status = %status.code, "Status notification");
                Disposition::Continue
            }
            (code, _) if code.is_peer_error() => {
                warn!(status = %code, position = %sequencer, "Peer reported error");
                Disposition::PeerError(code)
            }
            // The parser never builds XOFF/XON/SYNC_LOST without an id.
            (code, _) => {
                warn!(status = %code, "Flow-control status without fragment id");
                Disposition::Continue
            }
        }
    }
}
