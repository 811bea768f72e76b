//! Session states and the transfer state machine.
//!
//! `TransferMachine` holds no I/O: the session feeds it status
//! notifications and write outcomes and asks it what to do next, which
//! keeps the fragment/flow logic testable without link timing.

use std::fmt;

use tracing::{debug, info};

use super::flow::{Disposition, FlowController};
use crate::payload::{FirmwareImage, Fragment, PacketSequencer};
use crate::protocol::{StatusCode, StatusNotification};

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Transport,
    Desynchronization,
    PeerReported(StatusCode),
    ProtocolViolation,
    Aborted,
    /// API misuse (wrong state, bad configuration).
    Usage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Transport => write!(f, "transport failure"),
            FailureKind::Desynchronization => write!(f, "desynchronization"),
            FailureKind::PeerReported(code) => write!(f, "peer reported {code}"),
            FailureKind::ProtocolViolation => write!(f, "protocol violation"),
            FailureKind::Aborted => write!(f, "aborted"),
            FailureKind::Usage => write!(f, "usage error"),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Transferring { paused: bool },
    Verifying,
    Committing,
    Done,
    Failed(FailureKind),
}

/// Payload-free name of a `SessionState`, used in error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Starting,
    Transferring,
    Verifying,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => write!(f, "IDLE"),
            Stage::Starting => write!(f, "STARTING"),
            Stage::Transferring => write!(f, "TRANSFERRING"),
            Stage::Verifying => write!(f, "VERIFYING"),
            Stage::Committing => write!(f, "COMMITTING"),
            Stage::Done => write!(f, "DONE"),
            Stage::Failed => write!(f, "FAILED"),
        }
    }
}

impl SessionState {
    pub fn stage(&self) -> Stage {
        match self {
            SessionState::Idle => Stage::Idle,
            SessionState::Starting => Stage::Starting,
            SessionState::Transferring { .. } => Stage::Transferring,
            SessionState::Verifying => Stage::Verifying,
            SessionState::Committing => Stage::Committing,
            SessionState::Done => Stage::Done,
            SessionState::Failed(_) => Stage::Failed,
        }
    }

    /// Done and Failed accept no further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Transferring { paused: true } => write!(f, "TRANSFERRING (paused)"),
            SessionState::Failed(kind) => write!(f, "FAILED ({kind})"),
            other => write!(f, "{}", other.stage()),
        }
    }
}

/// What the session should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction<'a> {
    /// Write this fragment.
    Send(Fragment<'a>),
    /// Paused by the peer; only poll for status.
    Wait,
    /// The final fragment has been written.
    Complete,
}

/// Fragment/flow-control state while Transferring.
#[derive(Debug)]
pub struct TransferMachine<'a> {
    image: &'a FirmwareImage,
    sequencer: PacketSequencer,
    flow: FlowController,
    send_complete: bool,
    consecutive_timeouts: u32,
    frames_written: u64,
}

impl<'a> TransferMachine<'a> {
    pub fn new(image: &'a FirmwareImage, fragment_size: usize) -> Self {
        Self {
            image,
            sequencer: PacketSequencer::new(fragment_size),
            flow: FlowController::new(),
            send_complete: false,
            consecutive_timeouts: 0,
            frames_written: 0,
        }
    }

    pub fn sequencer(&self) -> &PacketSequencer {
        &self.sequencer
    }

    pub fn is_paused(&self) -> bool {
        self.flow.is_paused()
    }

    pub fn is_complete(&self) -> bool {
        self.send_complete
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Bytes up to the current position, capped at the image length.
    pub fn bytes_sent(&self) -> usize {
        self.sequencer.byte_offset().min(self.image.len())
    }

    pub fn total_bytes(&self) -> usize {
        self.image.len()
    }

    /// Apply a status notification.
    ///
    /// A rewind that lands on or before the final packet re-opens a transfer
    /// that was already complete.
    pub fn on_status(&mut self, status: &StatusNotification) -> Disposition {
        let disposition = self.flow.apply(status, &mut self.sequencer);
        let rewound = matches!(
            disposition,
            Disposition::Paused { .. } | Disposition::Resumed { .. } | Disposition::Resynchronized { .. }
        );
        if rewound && self.send_complete && self.sequencer.packet_number() <= self.final_packet() {
            debug!(position = %self.sequencer, "Rewound behind the final fragment");
            self.send_complete = false;
        }
        disposition
    }

    /// Packet number of the short fragment that ends the image.
    fn final_packet(&self) -> u32 {
        self.image.frame_count(self.sequencer.fragment_size()) - 1
    }

    pub fn next_action(&self) -> TransferAction<'a> {
        if self.send_complete {
            TransferAction::Complete
        } else if self.flow.is_paused() {
            TransferAction::Wait
        } else {
            TransferAction::Send(self.sequencer.current(self.image))
        }
    }

    /// The link accepted `fragment`.
    pub fn on_write_ok(&mut self, fragment: &Fragment<'_>) {
        self.frames_written += 1;
        self.consecutive_timeouts = 0;
        self.sequencer.advance();
        if fragment.is_final(self.sequencer.fragment_size()) {
            info!(packet = fragment.packet_number, "Final fragment written");
            self.send_complete = true;
        }
    }

    /// The write timed out; the same fragment goes again.
    /// Returns the number of timeouts in a row.
    pub fn on_write_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.consecutive_timeouts
    }

    /// Peer reported SYNC_LOST after the last fragment; resume from there.
    pub fn resume_from(&mut self, peer_fragment_id: u8) {
        self.sequencer.rewind(peer_fragment_id);
        self.send_complete = false;
        debug!(position = %self.sequencer, "Transfer resumed after sync loss");
    }
}
