//! Control characteristic opcodes (host -> peripheral).

use std::fmt;

/// One-byte command written to the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Open a FOTA session.
    Start = 0x01,
    /// Abandon the current session.
    Stop = 0x02,
    /// Finalize and apply the received image.
    Commit = 0x03,
    SetXoff = 0x41,
    SetXon = 0x42,
    SetFragmentId = 0x43,
}

impl ControlOpcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Stop),
            0x03 => Some(Self::Commit),
            0x41 => Some(Self::SetXoff),
            0x42 => Some(Self::SetXon),
            0x43 => Some(Self::SetFragmentId),
            _ => None,
        }
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOpcode::Start => write!(f, "START"),
            ControlOpcode::Stop => write!(f, "STOP"),
            ControlOpcode::Commit => write!(f, "COMMIT"),
            ControlOpcode::SetXoff => write!(f, "SET_XOFF"),
            ControlOpcode::SetXon => write!(f, "SET_XON"),
            ControlOpcode::SetFragmentId => write!(f, "SET_FRAGMENT_ID"),
        }
    }
}
