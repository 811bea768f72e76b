//! Payload module - firmware image handling and fragment sequencing.

pub mod image;
pub mod sequencer;

pub use image::{FirmwareImage, ImageError};
pub use sequencer::{Fragment, PacketSequencer};
