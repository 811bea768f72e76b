//! Packet sequencing: fragment ids, rollover tracking and framing.

use std::fmt;

use super::image::FirmwareImage;
use crate::protocol::constants::{FRAGMENT_ID_MODULUS, FRAGMENT_SIZE};

/// One framed fragment ready for the binary stream characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Rollover-extended index.
    pub packet_number: u32,
    /// Wire id (packet number modulo 256).
    pub fragment_id: u8,
    pub payload: &'a [u8],
}

impl Fragment<'_> {
    /// Id-prefixed wire frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 1);
        frame.push(self.fragment_id);
        frame.extend_from_slice(self.payload);
        frame
    }

    /// A fragment shorter than the capacity ends the image.
    pub fn is_final(&self, fragment_size: usize) -> bool {
        self.payload.len() < fragment_size
    }
}

/// Sender-side position: `rollover_counter * 256 + fragment_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSequencer {
    fragment_id: u8,
    rollover_counter: u32,
    fragment_size: usize,
}

impl Default for PacketSequencer {
    fn default() -> Self {
        Self::new(FRAGMENT_SIZE)
    }
}

impl PacketSequencer {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            fragment_id: 0,
            rollover_counter: 0,
            fragment_size,
        }
    }

    pub fn fragment_id(&self) -> u8 {
        self.fragment_id
    }

    pub fn rollover_counter(&self) -> u32 {
        self.rollover_counter
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn packet_number(&self) -> u32 {
        self.rollover_counter * FRAGMENT_ID_MODULUS + u32::from(self.fragment_id)
    }

    /// Byte offset of the current fragment's payload.
    pub fn byte_offset(&self) -> usize {
        self.packet_number() as usize * self.fragment_size
    }

    /// Step to the next fragment, rolling over after id 255.
    pub fn advance(&mut self) {
        if self.fragment_id == u8::MAX {
            self.fragment_id = 0;
            self.rollover_counter += 1;
        } else {
            self.fragment_id += 1;
        }
    }

    /// Adopt the peer-reported fragment id.
    ///
    /// A reported id above the local one means the peer is behind us across
    /// a rollover boundary, so the rollover counter steps back one lap.
    pub fn rewind(&mut self, peer_fragment_id: u8) {
        if peer_fragment_id > self.fragment_id {
            self.rollover_counter = self.rollover_counter.saturating_sub(1);
        }
        self.fragment_id = peer_fragment_id;
    }

    /// Payload slice for `packet_number`.
    pub fn fragment_for<'a>(&self, image: &'a FirmwareImage, packet_number: u32) -> &'a [u8] {
        image.fragment(packet_number, self.fragment_size)
    }

    /// Fragment at the current position.
    pub fn current<'a>(&self, image: &'a FirmwareImage) -> Fragment<'a> {
        let packet_number = self.packet_number();
        Fragment {
            packet_number,
            fragment_id: self.fragment_id,
            payload: self.fragment_for(image, packet_number),
        }
    }
}

impl fmt::Display for PacketSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} (id {}, lap {})",
            self.packet_number(),
            self.fragment_id,
            self.rollover_counter
        )
    }
}
