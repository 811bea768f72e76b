//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow a FOTA session without tight
//! coupling to the core logic.

use std::fmt;
use std::sync::Mutex;

use crate::protocol::StatusNotification;
use crate::state::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a FOTA session and the update orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FotaEvent {
    /// Connected to the named peripheral.
    DeviceConnected { name: String },
    /// Link handed back to the connector.
    DeviceReleased,
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Status notification or read decoded.
    StatusReceived { status: StatusNotification },
    /// A fragment was accepted by the link.
    FragmentSent {
        packet_number: u32,
        fragment_id: u8,
        len: usize,
    },
    /// A fragment write timed out and will be retried.
    WriteTimeout { packet_number: u32, consecutive: u32 },
    /// Sequencer rewound to a peer-reported fragment id.
    Rewound { fragment_id: u8, packet_number: u32 },
    /// Transfer progress in bytes.
    Progress { sent: u64, total: u64 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred.
    Error { message: String },
    /// Raw packet sent/received.
    Packet {
        direction: PacketDirection,
        channel: &'static str,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Commit written.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Peripheral)
    Rx, // Receive (Peripheral -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving FOTA events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FotaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FotaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FotaObserver for NullObserver {
    fn on_event(&self, _event: &FotaEvent) {}
}

/// Observer that keeps every event, for inspection after a run.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<FotaEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FotaEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Every state the session passed through, in order.
    pub fn states(&self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FotaEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl FotaObserver for RecordingObserver {
    fn on_event(&self, event: &FotaEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FotaObserver for TracingObserver {
    fn on_event(&self, event: &FotaEvent) {
        match event {
            FotaEvent::DeviceConnected { name } => {
                tracing::info!(name = %name, "Device connected");
            }
            FotaEvent::DeviceReleased => {
                tracing::info!("Device released");
            }
            FotaEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            FotaEvent::StatusReceived { status } => {
                tracing::debug!(status = %status, "Status received");
            }
            FotaEvent::FragmentSent {
                packet_number,
                fragment_id,
                len,
            } => {
                tracing::trace!(packet = packet_number, id = fragment_id, len = len, "Fragment sent");
            }
            FotaEvent::WriteTimeout {
                packet_number,
                consecutive,
            } => {
                tracing::warn!(packet = packet_number, consecutive = consecutive, "Timeout writing binary stream");
            }
            FotaEvent::Rewound {
                fragment_id,
                packet_number,
            } => {
                tracing::info!(id = fragment_id, packet = packet_number, "Sequencer rewound");
            }
            FotaEvent::Progress { sent, total } => {
                let pct = if *total > 0 { (*sent * 100) / *total } else { 100 };
                tracing::debug!(sent = sent, total = total, progress = %format!("{}%", pct), "Progress");
            }
            FotaEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FotaEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            FotaEvent::Packet {
                direction,
                channel,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, channel = channel, len = length, "Packet");
            }
            FotaEvent::Complete => {
                tracing::info!("Commit sent");
            }
        }
    }
}
