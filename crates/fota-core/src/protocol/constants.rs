//! Protocol constants for the BLE FOTA service.
//!
//! Service and characteristic identifiers are fixed 128-bit UUIDs. The FOTA
//! service uses the 53880000-… base, descriptive fields use Bluetooth SIG
//! short identifiers expanded onto the SIG base UUID.

use uuid::Uuid;

// ============================================================================
// GATT Identification
// ============================================================================

/// FOTA service.
pub const FOTA_SERVICE_UUID: Uuid = Uuid::from_u128(0x5388_0000_65fd_4651_ba8e_9152_7f06_c887);

/// Binary stream characteristic (fragments, write without response).
pub const BINARY_STREAM_CHAR_UUID: Uuid =
    Uuid::from_u128(0x5388_0001_65fd_4651_ba8e_9152_7f06_c887);

/// Control characteristic (opcodes, write with response).
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x5388_0002_65fd_4651_ba8e_9152_7f06_c887);

/// Status characteristic (notify + read).
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x5388_0003_65fd_4651_ba8e_9152_7f06_c887);

/// Device Information service (0x180A).
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = sig_uuid(0x180A);

/// Firmware Revision String characteristic (0x2A26).
pub const FIRMWARE_REVISION_CHAR_UUID: Uuid = sig_uuid(0x2A26);

/// Characteristic User Description descriptor (0x2901).
pub const USER_DESCRIPTION_DESCRIPTOR_UUID: Uuid = sig_uuid(0x2901);

/// Expand a Bluetooth SIG short identifier onto the SIG base UUID
/// (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

// ============================================================================
// Framing
// ============================================================================

/// Default payload bytes per fragment (excluding the fragment-id prefix).
pub const FRAGMENT_SIZE: usize = 128;

/// Largest payload that still fits a single 244-byte link write with the
/// fragment-id prefix.
pub const MAX_FRAGMENT_SIZE: usize = 243;

/// Fragment ids wrap after this many fragments.
pub const FRAGMENT_ID_MODULUS: u32 = 256;

// ============================================================================
// Retry / Timing Defaults
// ============================================================================

/// Start-phase attempts waiting for XON.
pub const MAXIMUM_RETRIES: u32 = 6;

pub const STATUS_TIMEOUT_MS: u64 = 10_000;
pub const CONTROL_TIMEOUT_MS: u64 = 10_000;
pub const WRITE_TIMEOUT_MS: u64 = 25;
pub const PACING_DELAY_MS: u64 = 75;
pub const WRITE_BACKOFF_MS: u64 = 100;
pub const PAUSE_POLL_MS: u64 = 50;
pub const RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const RECONNECT_RETRIES: u32 = 6;
pub const MAX_CONSECUTIVE_WRITE_TIMEOUTS: u32 = 50;
pub const MAX_RESYNC_ATTEMPTS: u32 = 3;

/// Advertised name of the demo peripheral.
pub const DEFAULT_DEVICE_NAME: &str = "FOTADemo";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid_expansion() {
        assert_eq!(
            FIRMWARE_REVISION_CHAR_UUID.to_string(),
            "00002a26-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            DEVICE_INFORMATION_SERVICE_UUID.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_fota_uuids() {
        assert_eq!(
            FOTA_SERVICE_UUID.to_string(),
            "53880000-65fd-4651-ba8e-91527f06c887"
        );
        assert_eq!(
            STATUS_CHAR_UUID.to_string(),
            "53880003-65fd-4651-ba8e-91527f06c887"
        );
    }
}
