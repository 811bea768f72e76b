//! FOTA-Core: BLE firmware-over-the-air update client in Rust.
//!
//! This crate drives a firmware image from a central to a peripheral that
//! implements the FOTA GATT service: a binary stream characteristic for
//! fragments, a control characteristic for START/STOP/COMMIT and a status
//! characteristic that notifies flow control and synchronization state.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: UUIDs, control opcodes, status codes and their parsing
//! - **Payload**: Firmware image and the packet sequencer
//! - **Transport**: Link abstraction (mock, simulated peripheral)
//! - **State**: Session states and the sans-IO transfer machine
//! - **Monitor**: Single-slot mailbox for status notifications
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: One START/transfer/COMMIT cycle over a link
//! - **Updater**: Connect, update, reconnect and verify the revision
//!
//! # Example
//!
//! ```no_run
//! use fota_core::{FirmwareImage, FirmwareUpdater, SessionConfig};
//! use fota_core::transport::{PeripheralBehavior, SimulatedConnector, SimulatedPeripheral};
//!
//! let image = FirmwareImage::load("app_update.bin").expect("unreadable image");
//! let peer = SimulatedPeripheral::new(PeripheralBehavior::default());
//!
//! let mut updater = FirmwareUpdater::new(SimulatedConnector::new(peer), SessionConfig::default());
//! let report = updater.run(&image).expect("FOTA failed");
//! println!("{}", report.after());
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod monitor;
pub mod payload;
pub mod policy;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod updater;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{FotaError, Result};
pub use events::{FotaEvent, FotaObserver, LogLevel, NullObserver, RecordingObserver, TracingObserver};
pub use identity::{FirmwareIdentity, UpdateOutcome, read_firmware_identity, verify_update};
pub use monitor::{MonitorError, StatusMonitor};
pub use payload::{FirmwareImage, Fragment, ImageError, PacketSequencer};
pub use policy::{RetryPolicy, StartHandshake};
pub use protocol::{ControlOpcode, StatusCode, StatusError, StatusNotification};
pub use session::{AbortHandle, FotaSession};
pub use state::{FailureKind, SessionState, Stage};
pub use transport::{Characteristic, DeviceConnector, Link, LinkError, MockLink};
pub use updater::{FirmwareUpdater, UpdateReport};
