//! Link layer abstraction.
//!
//! Defines the `Link` trait for GATT-style communication with the
//! peripheral and the `DeviceConnector` trait that hands out links,
//! allowing different implementations (BLE stacks, simulator, mock).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::constants::{
    BINARY_STREAM_CHAR_UUID, CONTROL_CHAR_UUID, DEVICE_INFORMATION_SERVICE_UUID,
    FIRMWARE_REVISION_CHAR_UUID, FOTA_SERVICE_UUID, STATUS_CHAR_UUID,
};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Characteristic {characteristic} not found")]
    CharacteristicNotFound { characteristic: Characteristic },

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl LinkError {
    pub fn timeout(timeout: Duration) -> Self {
        LinkError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }
}

/// A characteristic addressed by its owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl Characteristic {
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }

    pub const BINARY_STREAM: Self = Self::new(FOTA_SERVICE_UUID, BINARY_STREAM_CHAR_UUID);
    pub const CONTROL: Self = Self::new(FOTA_SERVICE_UUID, CONTROL_CHAR_UUID);
    pub const STATUS: Self = Self::new(FOTA_SERVICE_UUID, STATUS_CHAR_UUID);
    pub const FOTA_FIRMWARE_REVISION: Self =
        Self::new(FOTA_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID);
    pub const DIS_FIRMWARE_REVISION: Self =
        Self::new(DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID);
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

/// Callback invoked with each raw notification payload.
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Abstract link to a connected peripheral.
///
/// Writes on one characteristic are delivered in order. Notifications arrive
/// on an independent path and may be delivered from any thread.
pub trait Link: Send + Sync {
    /// Register `callback` for notifications on `characteristic`.
    fn subscribe(
        &self,
        characteristic: Characteristic,
        callback: NotificationCallback,
    ) -> Result<(), LinkError>;

    /// Write `data`, failing with `LinkError::Timeout` if the link does not
    /// accept it within `timeout`.
    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), LinkError>;

    /// Synchronous characteristic read.
    fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError>;

    /// Read a descriptor. `Ok(None)` when the descriptor is absent.
    fn read_descriptor(
        &self,
        characteristic: Characteristic,
        descriptor: Uuid,
    ) -> Result<Option<Vec<u8>>, LinkError>;

    /// Check whether the peer exposes `characteristic`.
    fn has_characteristic(&self, characteristic: Characteristic) -> bool;

    /// Check if the peer is still connected.
    fn is_connected(&self) -> bool;
}

/// Discovery and connection of peripherals.
pub trait DeviceConnector {
    type Link: Link;

    /// Connect to the peripheral advertising `name`.
    /// `Ok(None)` means it is not currently reachable.
    fn connect(&mut self, name: &str) -> Result<Option<Self::Link>, LinkError>;

    /// Hand a link back, disconnecting it.
    fn release(&mut self, link: Self::Link);
}
