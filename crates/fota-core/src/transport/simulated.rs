//! In-memory FOTA peripheral.
//!
//! Behaves like a receiver implementing the FOTA service: reassembles the
//! binary stream, asserts XOFF/XON, reports SYNC_LOST when a fragment goes
//! missing, installs the image on COMMIT and comes back with a new firmware
//! revision after a simulated reboot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{Characteristic, DeviceConnector, Link, LinkError, NotificationCallback};
use crate::protocol::constants::{
    DEFAULT_DEVICE_NAME, FRAGMENT_ID_MODULUS, FRAGMENT_SIZE, USER_DESCRIPTION_DESCRIPTOR_UUID,
};
use crate::protocol::{ControlOpcode, StatusCode, StatusNotification};

/// Knobs for the simulated receiver.
#[derive(Debug, Clone)]
pub struct PeripheralBehavior {
    pub name: String,
    pub fragment_size: usize,
    pub initial_revision: String,
    pub updated_revision: String,
    pub description: Option<String>,
    /// Expose the Firmware Revision String inside the FOTA service.
    /// Otherwise only Device Information carries it.
    pub fota_scoped_revision: bool,
    /// Answer START with XON.
    pub accept_start: bool,
    /// Assert XOFF right after accepting this packet number.
    pub xoff_after: Option<u32>,
    /// How long XOFF lasts before XON is notified.
    pub pause: Duration,
    /// Lose this packet number once.
    pub drop_packet: Option<u32>,
    /// Report sync loss only through the readable status value.
    pub silent_sync_loss: bool,
    /// Connection attempts refused while rebooting after COMMIT.
    pub reboot_polls: u32,
}

impl Default for PeripheralBehavior {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            fragment_size: FRAGMENT_SIZE,
            initial_revision: "1.0.0".to_string(),
            updated_revision: "1.1.0".to_string(),
            description: None,
            fota_scoped_revision: true,
            accept_start: true,
            xoff_after: None,
            pause: Duration::from_millis(20),
            drop_packet: None,
            silent_sync_loss: false,
            reboot_polls: 1,
        }
    }
}

#[derive(Default)]
struct PeerState {
    connected: bool,
    subscriber: Option<NotificationCallback>,
    session_open: bool,
    /// Next packet number the receiver expects.
    expected_packet: u32,
    received: Vec<u8>,
    /// Readable status characteristic value.
    status: Vec<u8>,
    in_sync: bool,
    loss_reported: bool,
    paused: bool,
    dropped: bool,
    xoff_sent: bool,
    final_received: bool,
    frames_received: u64,
    revision: String,
    installed: Option<Vec<u8>>,
    reboot_polls_left: u32,
}

impl PeerState {
    fn expected_id(&self) -> u8 {
        (self.expected_packet % FRAGMENT_ID_MODULUS) as u8
    }

    fn set_status(&mut self, status: StatusNotification) -> Vec<u8> {
        self.status = status.to_bytes();
        self.status.clone()
    }
}

/// Simulated FOTA peripheral. Clones share the same device.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    behavior: Arc<PeripheralBehavior>,
    state: Arc<Mutex<PeerState>>,
}

impl SimulatedPeripheral {
    pub fn new(behavior: PeripheralBehavior) -> Self {
        let state = PeerState {
            connected: true,
            status: vec![StatusCode::Ok.as_byte()],
            in_sync: true,
            revision: behavior.initial_revision.clone(),
            ..PeerState::default()
        };
        Self {
            behavior: Arc::new(behavior),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn behavior(&self) -> &PeripheralBehavior {
        &self.behavior
    }

    /// Image applied by the last successful COMMIT.
    pub fn installed_image(&self) -> Option<Vec<u8>> {
        self.state().installed.clone()
    }

    pub fn revision(&self) -> String {
        self.state().revision.clone()
    }

    pub fn frames_received(&self) -> u64 {
        self.state().frames_received
    }

    pub fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.subscriber = None;
    }

    /// Reconnect, unless still rebooting.
    fn reconnect(&self) -> bool {
        let mut state = self.state();
        if state.reboot_polls_left > 0 {
            state.reboot_polls_left -= 1;
            return false;
        }
        state.connected = true;
        state.session_open = false;
        state.subscriber = None;
        state.status = vec![StatusCode::Ok.as_byte()];
        true
    }

    fn notify(subscriber: Option<NotificationCallback>, payloads: Vec<Vec<u8>>) {
        if let Some(callback) = subscriber {
            for payload in payloads {
                callback(&payload);
            }
        }
    }

    fn on_control(&self, state: &mut PeerState, opcode: ControlOpcode) -> Vec<Vec<u8>> {
        match opcode {
            ControlOpcode::Start => {
                info!("Simulated peripheral: FOTA session opened");
                state.session_open = true;
                state.expected_packet = 0;
                state.received.clear();
                state.in_sync = true;
                state.loss_reported = false;
                state.paused = false;
                state.final_received = false;
                if self.behavior.accept_start {
                    vec![state.set_status(StatusNotification::with_fragment(StatusCode::Xon, 0))]
                } else {
                    Vec::new()
                }
            }
            ControlOpcode::Stop => {
                state.session_open = false;
                state.set_status(StatusNotification::new(StatusCode::Ok));
                Vec::new()
            }
            ControlOpcode::Commit => {
                if state.session_open && state.in_sync && state.final_received {
                    info!(
                        bytes = state.received.len(),
                        "Simulated peripheral: installing image"
                    );
                    state.installed = Some(state.received.clone());
                    state.revision = self.behavior.updated_revision.clone();
                    state.session_open = false;
                    state.reboot_polls_left = self.behavior.reboot_polls;
                    let status =
                        state.set_status(StatusNotification::new(StatusCode::UpdateSuccessful));
                    state.connected = false;
                    vec![status]
                } else {
                    warn!("Simulated peripheral: commit rejected");
                    vec![state.set_status(StatusNotification::new(StatusCode::ValidationFailure))]
                }
            }
            ControlOpcode::SetXoff | ControlOpcode::SetXon | ControlOpcode::SetFragmentId => {
                Vec::new()
            }
        }
    }

    fn on_fragment(&self, state: &mut PeerState, frame: &[u8]) -> Vec<Vec<u8>> {
        let Some((&id, payload)) = frame.split_first() else {
            return Vec::new();
        };
        if !state.session_open {
            return vec![state.set_status(StatusNotification::new(StatusCode::NoFotaSession))];
        }
        if state.paused {
            return Vec::new();
        }

        let expected = state.expected_id();
        if id != expected {
            if state.loss_reported {
                return Vec::new();
            }
            debug!(got = id, expected, "Simulated peripheral: sync lost");
            state.in_sync = false;
            state.loss_reported = true;
            let status =
                state.set_status(StatusNotification::with_fragment(StatusCode::SyncLost, expected));
            return if self.behavior.silent_sync_loss {
                Vec::new()
            } else {
                vec![status]
            };
        }

        if self.behavior.drop_packet == Some(state.expected_packet) && !state.dropped {
            debug!(packet = state.expected_packet, "Simulated peripheral: dropping packet");
            state.dropped = true;
            state.in_sync = false;
            state.loss_reported = false;
            state.set_status(StatusNotification::with_fragment(StatusCode::SyncLost, expected));
            return Vec::new();
        }

        if !state.in_sync {
            state.in_sync = true;
            state.loss_reported = false;
            state.set_status(StatusNotification::new(StatusCode::Ok));
        }

        let accepted = state.expected_packet;
        let base = accepted as usize * self.behavior.fragment_size;
        state.received.truncate(base);
        state.received.extend_from_slice(payload);
        state.expected_packet += 1;
        state.frames_received += 1;
        state.final_received = payload.len() < self.behavior.fragment_size;

        if self.behavior.xoff_after == Some(accepted) && !state.xoff_sent {
            state.xoff_sent = true;
            state.paused = true;
            let resume_at = state.expected_id();
            self.schedule_xon(resume_at);
            return vec![state.set_status(StatusNotification::with_fragment(
                StatusCode::Xoff,
                resume_at,
            ))];
        }
        Vec::new()
    }

    fn schedule_xon(&self, fragment_id: u8) {
        let peer = self.clone();
        let pause = self.behavior.pause;
        thread::spawn(move || {
            thread::sleep(pause);
            let (subscriber, status) = {
                let mut state = peer.state();
                state.paused = false;
                let status =
                    state.set_status(StatusNotification::with_fragment(StatusCode::Xon, fragment_id));
                (state.subscriber.clone(), status)
            };
            Self::notify(subscriber, vec![status]);
        });
    }
}

impl Link for SimulatedPeripheral {
    fn subscribe(
        &self,
        characteristic: Characteristic,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if characteristic != Characteristic::STATUS {
            return Err(LinkError::SubscribeFailed(format!(
                "{characteristic} does not notify"
            )));
        }
        state.subscriber = Some(callback);
        Ok(())
    }

    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        _with_response: bool,
        _timeout: Duration,
    ) -> Result<(), LinkError> {
        let (subscriber, payloads) = {
            let mut state = self.state();
            if !state.connected {
                return Err(LinkError::Disconnected);
            }
            let payloads = if characteristic == Characteristic::BINARY_STREAM {
                self.on_fragment(&mut state, data)
            } else if characteristic == Characteristic::CONTROL {
                let opcode = data
                    .first()
                    .and_then(|&b| ControlOpcode::from_byte(b))
                    .ok_or_else(|| LinkError::WriteFailed(format!("bad opcode {data:02X?}")))?;
                self.on_control(&mut state, opcode)
            } else {
                return Err(LinkError::CharacteristicNotFound { characteristic });
            };
            (state.subscriber.clone(), payloads)
        };

        Self::notify(subscriber, payloads);
        Ok(())
    }

    fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        let state = self.state();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if characteristic == Characteristic::STATUS {
            Ok(state.status.clone())
        } else if characteristic == Characteristic::DIS_FIRMWARE_REVISION
            || (characteristic == Characteristic::FOTA_FIRMWARE_REVISION
                && self.behavior.fota_scoped_revision)
        {
            Ok(state.revision.clone().into_bytes())
        } else {
            Err(LinkError::CharacteristicNotFound { characteristic })
        }
    }

    fn read_descriptor(
        &self,
        characteristic: Characteristic,
        descriptor: Uuid,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        if characteristic == Characteristic::FOTA_FIRMWARE_REVISION
            && descriptor == USER_DESCRIPTION_DESCRIPTOR_UUID
        {
            Ok(self
                .behavior
                .description
                .as_ref()
                .map(|d| d.clone().into_bytes()))
        } else {
            Ok(None)
        }
    }

    fn has_characteristic(&self, characteristic: Characteristic) -> bool {
        characteristic == Characteristic::BINARY_STREAM
            || characteristic == Characteristic::CONTROL
            || characteristic == Characteristic::STATUS
            || characteristic == Characteristic::DIS_FIRMWARE_REVISION
            || (characteristic == Characteristic::FOTA_FIRMWARE_REVISION
                && self.behavior.fota_scoped_revision)
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

/// Connector that hands out links to one simulated peripheral.
pub struct SimulatedConnector {
    peripheral: SimulatedPeripheral,
    attempts: u32,
}

impl SimulatedConnector {
    pub fn new(peripheral: SimulatedPeripheral) -> Self {
        Self {
            peripheral,
            attempts: 0,
        }
    }

    pub fn peripheral(&self) -> &SimulatedPeripheral {
        &self.peripheral
    }

    /// Total connection attempts, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl DeviceConnector for SimulatedConnector {
    type Link = SimulatedPeripheral;

    fn connect(&mut self, name: &str) -> Result<Option<Self::Link>, LinkError> {
        self.attempts += 1;
        if name != self.peripheral.behavior.name {
            debug!(name, "No simulated peripheral with that name");
            return Ok(None);
        }
        if !self.peripheral.reconnect() {
            debug!(name, "Simulated peripheral still rebooting");
            return Ok(None);
        }
        Ok(Some(self.peripheral.clone()))
    }

    fn release(&mut self, link: Self::Link) {
        link.disconnect();
    }
}
