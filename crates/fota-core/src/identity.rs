//! Firmware identity: read the peer's firmware revision and compare it
//! before and after an update.

use std::fmt;

use tracing::{debug, info};

use crate::error::{FotaError, Result};
use crate::protocol::constants::USER_DESCRIPTION_DESCRIPTOR_UUID;
use crate::transport::{Characteristic, Link};

/// Firmware revision, optionally tagged with the description of the
/// embedded device it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareIdentity {
    pub revision: String,
    pub description: Option<String>,
}

impl fmt::Display for FirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} for device \"{}\"", self.revision, description),
            None => write!(f, "{}", self.revision),
        }
    }
}

/// Read the firmware revision.
///
/// Prefers the Firmware Revision String scoped to the FOTA service, with its
/// optional user description, and falls back to the Device Information
/// service.
pub fn read_firmware_identity<L: Link + ?Sized>(link: &L) -> Result<FirmwareIdentity> {
    if link.has_characteristic(Characteristic::FOTA_FIRMWARE_REVISION) {
        let characteristic = Characteristic::FOTA_FIRMWARE_REVISION;
        let revision = decode(&link.read(characteristic)?);
        let description = link
            .read_descriptor(characteristic, USER_DESCRIPTION_DESCRIPTOR_UUID)?
            .map(|bytes| decode(&bytes));
        let identity = FirmwareIdentity {
            revision,
            description,
        };
        info!(identity = %identity, "FOTA service firmware revision");
        return Ok(identity);
    }

    if link.has_characteristic(Characteristic::DIS_FIRMWARE_REVISION) {
        let revision = decode(&link.read(Characteristic::DIS_FIRMWARE_REVISION)?);
        debug!(revision = %revision, "Device Information firmware revision");
        return Ok(FirmwareIdentity {
            revision,
            description: None,
        });
    }

    Err(FotaError::FirmwareRevisionUnavailable)
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Result of comparing identities across an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The revision changed.
    Applied {
        before: FirmwareIdentity,
        after: FirmwareIdentity,
    },
    /// The revision is the same as before.
    Unchanged(FirmwareIdentity),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Compare identities read before and after the session.
pub fn verify_update(before: FirmwareIdentity, after: FirmwareIdentity) -> UpdateOutcome {
    if before.revision != after.revision {
        info!(before = %before, after = %after, "Update successful");
        UpdateOutcome::Applied { before, after }
    } else {
        info!(revision = %after, "Update unsuccessful: revision unchanged");
        UpdateOutcome::Unchanged(after)
    }
}
