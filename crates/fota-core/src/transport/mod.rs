//! Transport layer abstraction.

pub mod mock;
pub mod simulated;
pub mod traits;

pub use mock::{MockLink, RecordedWrite};
pub use simulated::{PeripheralBehavior, SimulatedConnector, SimulatedPeripheral};
pub use traits::{Characteristic, DeviceConnector, Link, LinkError, NotificationCallback};
