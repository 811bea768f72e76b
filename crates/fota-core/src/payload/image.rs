//! Firmware image loading and fragment slicing.
//!
//! The image is an opaque, already-signed blob. It is read once before the
//! session starts and only ever viewed read-only afterwards.

use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image too large: {actual} bytes, maximum {maximum}")]
    TooLarge { actual: usize, maximum: usize },
}

/// Maximum image size. With one-byte fragments the position after the final
/// (empty) frame is `len + 1`, which must still fit a `u32` packet number.
pub const MAX_IMAGE_SIZE: usize = u32::MAX as usize - 1;

/// Immutable firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        if data.len() > MAX_IMAGE_SIZE {
            return Err(ImageError::TooLarge {
                actual: data.len(),
                maximum: MAX_IMAGE_SIZE,
            });
        }
        Ok(Self { data })
    }

    /// Read an image from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        info!(path = %path.display(), size = data.len(), "Loaded firmware image");
        Self::from_bytes(data)
    }

    /// Payload slice of `packet_number`, truncated at end of image.
    /// Empty once the offset reaches the image length.
    pub fn fragment(&self, packet_number: u32, fragment_size: usize) -> &[u8] {
        let start = (packet_number as usize).saturating_mul(fragment_size);
        if start >= self.data.len() {
            return &[];
        }
        let end = start.saturating_add(fragment_size).min(self.data.len());
        &self.data[start..end]
    }

    /// Number of frames a complete transfer emits, including the final short
    /// (possibly empty) one.
    pub fn frame_count(&self, fragment_size: usize) -> u32 {
        (self.data.len() / fragment_size) as u32 + 1
    }

    /// Get raw data.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Get total size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
