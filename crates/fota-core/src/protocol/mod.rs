//! Protocol module - FOTA wire format definitions.

pub mod constants;
pub mod opcode;
pub mod status;

pub use constants::*;
pub use opcode::ControlOpcode;
pub use status::{StatusCode, StatusError, StatusNotification};
