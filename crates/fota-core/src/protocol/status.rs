//! Status notification parsing.
//!
//! Byte 0 is the status code. XOFF, XON and SYNC_LOST carry a second byte:
//! the fragment id at which the condition applies.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Empty status payload")]
    Empty,

    #[error("Unknown status code 0x{0:02X}")]
    UnknownCode(u8),

    #[error("Status {0} is missing its fragment id")]
    MissingFragmentId(StatusCode),
}

/// One-byte status code reported by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    UpdateSuccessful = 0x01,
    Xoff = 0x02,
    Xon = 0x03,
    SyncLost = 0x04,
    UnspecifiedError = 0x05,
    ValidationFailure = 0x06,
    InstallationFailure = 0x07,
    OutOfMemory = 0x08,
    MemoryError = 0x09,
    HardwareError = 0x0a,
    NoFotaSession = 0x0b,
}

impl StatusCode {
    pub fn from_byte(byte: u8) -> Result<Self, StatusError> {
        let code = match byte {
            0x00 => StatusCode::Ok,
            0x01 => StatusCode::UpdateSuccessful,
            0x02 => StatusCode::Xoff,
            0x03 => StatusCode::Xon,
            0x04 => StatusCode::SyncLost,
            0x05 => StatusCode::UnspecifiedError,
            0x06 => StatusCode::ValidationFailure,
            0x07 => StatusCode::InstallationFailure,
            0x08 => StatusCode::OutOfMemory,
            0x09 => StatusCode::MemoryError,
            0x0a => StatusCode::HardwareError,
            0x0b => StatusCode::NoFotaSession,
            other => return Err(StatusError::UnknownCode(other)),
        };
        Ok(code)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Codes that carry a peer fragment id.
    pub fn carries_fragment_id(self) -> bool {
        matches!(
            self,
            StatusCode::Xoff | StatusCode::Xon | StatusCode::SyncLost
        )
    }

    /// Codes reporting a failure on the peripheral side.
    pub fn is_peer_error(self) -> bool {
        matches!(
            self,
            StatusCode::UnspecifiedError
                | StatusCode::ValidationFailure
                | StatusCode::InstallationFailure
                | StatusCode::OutOfMemory
                | StatusCode::MemoryError
                | StatusCode::HardwareError
                | StatusCode::NoFotaSession
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::UpdateSuccessful => "UPDATE_SUCCESSFUL",
            StatusCode::Xoff => "XOFF",
            StatusCode::Xon => "XON",
            StatusCode::SyncLost => "SYNC_LOST",
            StatusCode::UnspecifiedError => "UNSPECIFIED_ERROR",
            StatusCode::ValidationFailure => "VALIDATION_FAILURE",
            StatusCode::InstallationFailure => "INSTALLATION_FAILURE",
            StatusCode::OutOfMemory => "OUT_OF_MEMORY",
            StatusCode::MemoryError => "MEMORY_ERROR",
            StatusCode::HardwareError => "HARDWARE_ERROR",
            StatusCode::NoFotaSession => "NO_FOTA_SESSION",
        };
        f.write_str(name)
    }
}

/// A decoded status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusNotification {
    pub code: StatusCode,
    /// Peer-reported fragment id (XOFF/XON/SYNC_LOST only).
    pub fragment_id: Option<u8>,
}

impl StatusNotification {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            fragment_id: None,
        }
    }

    pub fn with_fragment(code: StatusCode, fragment_id: u8) -> Self {
        Self {
            code,
            fragment_id: Some(fragment_id),
        }
    }

    /// Parse a raw notification or read payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, StatusError> {
        let (&first, rest) = bytes.split_first().ok_or(StatusError::Empty)?;
        let code = StatusCode::from_byte(first)?;
        if code.carries_fragment_id() {
            let fragment_id = rest
                .first()
                .copied()
                .ok_or(StatusError::MissingFragmentId(code))?;
            Ok(Self::with_fragment(code, fragment_id))
        } else {
            Ok(Self::new(code))
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.code.as_byte()];
        if let Some(id) = self.fragment_id {
            bytes.push(id);
        }
        bytes
    }
}

impl fmt::Display for StatusNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fragment_id {
            Some(id) => write!(f, "{}@{}", self.code, id),
            None => write!(f, "{}", self.code),
        }
    }
}
