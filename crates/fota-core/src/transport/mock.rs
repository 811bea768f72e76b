//! Mock link for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use super::traits::{Characteristic, Link, LinkError, NotificationCallback};

/// A write captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub characteristic: Characteristic,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[derive(Default)]
struct MockState {
    /// Captured writes, including ones that timed out.
    write_log: Vec<RecordedWrite>,
    /// Number of binary stream write attempts so far.
    stream_writes: usize,
    /// Notifications to deliver once the N-th stream write is accepted.
    notify_after_stream_write: HashMap<usize, Vec<Vec<u8>>>,
    /// Notifications to deliver when a control opcode is written.
    notify_on_control: HashMap<u8, Vec<Vec<u8>>>,
    /// Stream write attempts (1-based) that time out.
    stream_timeouts: HashSet<usize>,
    /// Stream write attempts (1-based) rejected outright.
    stream_failures: HashSet<usize>,
    /// Queued values returned on read, per characteristic.
    reads: HashMap<Characteristic, VecDeque<Vec<u8>>>,
    /// Descriptor values.
    descriptors: HashMap<(Characteristic, Uuid), Vec<u8>>,
    /// Characteristics that exist beyond the FOTA core set.
    extra_characteristics: HashSet<Characteristic>,
    subscribers: HashMap<Characteristic, NotificationCallback>,
    connected: bool,
}

/// Scripted link for unit testing session logic.
///
/// Clones share state, so a test can keep a handle while the session owns
/// another one.
#[derive(Clone)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            })),
        }
    }

    /// Deliver `payload` to the status subscriber right now.
    pub fn notify(&self, payload: &[u8]) {
        let callback = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .get(&Characteristic::STATUS)
            .cloned();
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Deliver `payload` after the `n`-th (1-based) accepted stream write.
    pub fn notify_after_stream_write(&self, n: usize, payload: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .notify_after_stream_write
            .entry(n)
            .or_default()
            .push(payload.to_vec());
    }

    /// Deliver `payload` whenever `opcode` is written to the control point.
    pub fn notify_on_control(&self, opcode: u8, payload: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .notify_on_control
            .entry(opcode)
            .or_default()
            .push(payload.to_vec());
    }

    /// Make the `n`-th (1-based) stream write attempt time out.
    pub fn timeout_stream_write(&self, n: usize) {
        self.state.lock().unwrap().stream_timeouts.insert(n);
    }

    /// Make the `n`-th (1-based) stream write attempt fail.
    pub fn fail_stream_write(&self, n: usize) {
        self.state.lock().unwrap().stream_failures.insert(n);
    }

    /// Queue a value returned by the next read of `characteristic`.
    pub fn queue_read(&self, characteristic: Characteristic, value: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.extra_characteristics.insert(characteristic);
        state
            .reads
            .entry(characteristic)
            .or_default()
            .push_back(value.to_vec());
    }

    pub fn set_descriptor(&self, characteristic: Characteristic, descriptor: Uuid, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .descriptors
            .insert((characteristic, descriptor), value.to_vec());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().write_log.clone()
    }

    /// Get captured writes to one characteristic.
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.characteristic == characteristic)
            .map(|w| w.data)
            .collect()
    }

    /// Number of stream write attempts so far.
    pub fn stream_write_count(&self) -> usize {
        self.state.lock().unwrap().stream_writes
    }

    pub fn is_subscribed(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .contains_key(&Characteristic::STATUS)
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    fn deliver(&self, payloads: Vec<Vec<u8>>) {
        for payload in payloads {
            self.notify(&payload);
        }
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for MockLink {
    fn subscribe(
        &self,
        characteristic: Characteristic,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        state.subscribers.insert(characteristic, callback);
        Ok(())
    }

    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let pending = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(LinkError::Disconnected);
            }
            state.write_log.push(RecordedWrite {
                characteristic,
                data: data.to_vec(),
                with_response,
            });

            if characteristic == Characteristic::BINARY_STREAM {
                state.stream_writes += 1;
                let n = state.stream_writes;
                if state.stream_timeouts.contains(&n) {
                    return Err(LinkError::timeout(timeout));
                }
                if state.stream_failures.contains(&n) {
                    return Err(LinkError::WriteFailed(format!("scripted failure #{n}")));
                }
                state.notify_after_stream_write.remove(&n).unwrap_or_default()
            } else if characteristic == Characteristic::CONTROL {
                data.first()
                    .and_then(|op| state.notify_on_control.get(op))
                    .cloned()
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        self.deliver(pending);
        Ok(())
    }

    fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        match state.reads.get_mut(&characteristic) {
            Some(queue) => Ok(queue.pop_front().unwrap_or_else(|| vec![0x00])),
            None if characteristic == Characteristic::STATUS => Ok(vec![0x00]),
            None => Err(LinkError::CharacteristicNotFound { characteristic }),
        }
    }

    fn read_descriptor(
        &self,
        characteristic: Characteristic,
        descriptor: Uuid,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        let state = self.state.lock().unwrap();
        Ok(state.descriptors.get(&(characteristic, descriptor)).cloned())
    }

    fn has_characteristic(&self, characteristic: Characteristic) -> bool {
        characteristic == Characteristic::BINARY_STREAM
            || characteristic == Characteristic::CONTROL
            || characteristic == Characteristic::STATUS
            || self
                .state
                .lock()
                .unwrap()
                .extra_characteristics
                .contains(&characteristic)
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}
