//! Session-level error taxonomy.

use thiserror::Error;

use crate::protocol::{StatusCode, StatusError};
use crate::state::{FailureKind, Stage};
use crate::transport::LinkError;

#[derive(Error, Debug)]
pub enum FotaError {
    #[error("Timeout during {stage} after {attempts} attempt(s) of {timeout_ms}ms")]
    Timeout {
        stage: Stage,
        attempts: u32,
        timeout_ms: u64,
    },

    #[error("Transport failure during {stage} (last packet {packet_number:?}): {source}")]
    Transport {
        stage: Stage,
        packet_number: Option<u32>,
        #[source]
        source: LinkError,
    },

    #[error("Peer still out of sync at fragment {fragment_id} after {attempts} resync attempt(s)")]
    Desynchronization { fragment_id: u8, attempts: u32 },

    #[error("Peer reported {status} during {stage} (last packet {packet_number:?})")]
    PeerReported {
        stage: Stage,
        status: StatusCode,
        packet_number: Option<u32>,
    },

    #[error("Protocol violation during {stage}: {source}")]
    ProtocolViolation {
        stage: Stage,
        #[source]
        source: StatusError,
    },

    #[error("Session is {actual}, expected {expected}")]
    InvalidState { expected: Stage, actual: Stage },

    #[error("Aborted by caller during {stage} (last packet {packet_number:?})")]
    Aborted {
        stage: Stage,
        packet_number: Option<u32>,
    },

    #[error("No firmware revision characteristic on the peer")]
    FirmwareRevisionUnavailable,

    #[error("Device {name} not found")]
    DeviceNotFound { name: String },

    #[error("Failed to reconnect to {name} after {attempts} attempt(s)")]
    ReconnectFailed { name: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl FotaError {
    /// Classification recorded in `SessionState::Failed`.
    pub fn kind(&self) -> FailureKind {
        match self {
            FotaError::Timeout { .. } => FailureKind::Timeout,
            FotaError::Desynchronization { .. } => FailureKind::Desynchronization,
            FotaError::PeerReported { status, .. } => FailureKind::PeerReported(*status),
            FotaError::ProtocolViolation { .. } => FailureKind::ProtocolViolation,
            FotaError::Aborted { .. } => FailureKind::Aborted,
            FotaError::InvalidState { .. } | FotaError::Config(_) => FailureKind::Usage,
            FotaError::Transport { .. }
            | FotaError::FirmwareRevisionUnavailable
            | FotaError::DeviceNotFound { .. }
            | FotaError::ReconnectFailed { .. }
            | FotaError::Link(_) => FailureKind::Transport,
        }
    }
}

pub type Result<T, E = FotaError> = std::result::Result<T, E>;
