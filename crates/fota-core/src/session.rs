//! FOTA Session - drives one update over a connected link.
//!
//! Idle → Starting → Transferring → Verifying → Committing → Done, with any
//! unrecovered failure landing in the terminal `Failed` state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{FotaError, Result};
use crate::events::{FotaEvent, FotaObserver, LogLevel, PacketDirection, TracingObserver};
use crate::identity::{FirmwareIdentity, read_firmware_identity};
use crate::monitor::StatusMonitor;
use crate::payload::{FirmwareImage, Fragment};
use crate::policy::{HandshakeEvent, HandshakeStep, RetryPolicy, StartHandshake};
use crate::protocol::{ControlOpcode, StatusCode, StatusNotification};
use crate::state::{Disposition, SessionState, Stage, TransferAction, TransferMachine};
use crate::transport::{Characteristic, Link, LinkError, NotificationCallback};

/// Cancels a running session from another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One FOTA session over an exclusively owned link.
///
/// A session runs once. After `Done` or `Failed` every operation returns
/// `FotaError::InvalidState`; take the link back with [`FotaSession::into_link`].
pub struct FotaSession<L: Link, O: FotaObserver> {
    link: L,
    observer: Arc<O>,
    config: SessionConfig,
    policy: RetryPolicy,
    monitor: StatusMonitor,
    state: SessionState,
    abort: AbortHandle,
    last_packet: Option<u32>,
    last_status: Option<StatusNotification>,
}

impl<L: Link> FotaSession<L, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(link: L, config: SessionConfig) -> Self {
        Self::with_observer(link, config, Arc::new(TracingObserver))
    }
}

impl<L: Link, O: FotaObserver> FotaSession<L, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(link: L, config: SessionConfig, observer: Arc<O>) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            link,
            observer,
            config,
            policy,
            monitor: StatusMonitor::new(),
            state: SessionState::Idle,
            abort: AbortHandle::default(),
            last_packet: None,
            last_status: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn monitor(&self) -> &StatusMonitor {
        &self.monitor
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Share an abort handle created ahead of the session.
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Last packet number the link accepted.
    pub fn last_packet(&self) -> Option<u32> {
        self.last_packet
    }

    pub fn last_status(&self) -> Option<StatusNotification> {
        self.last_status
    }

    /// Give the link back to the caller.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Read the peer's firmware identity over this session's link.
    pub fn get_firmware_revision(&self) -> Result<FirmwareIdentity> {
        read_firmware_identity(&self.link())
    }

    /// Run start, transfer and commit in sequence.
    pub fn run(&mut self, image: &FirmwareImage) -> Result<()> {
        self.start()?;
        self.transfer(image)?;
        self.commit()
    }

    /// Subscribe to status, send START and wait for XON.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        self.expect_stage(Stage::Idle)?;
        if let Err(e) = self.config.validate() {
            return Err(self.fail(e));
        }
        self.goto(SessionState::Starting);

        let result = self.start_handshake();
        self.guard(result)?;

        info!("FOTA session started");
        self.goto(SessionState::Transferring { paused: false });
        Ok(())
    }

    fn start_handshake(&mut self) -> Result<()> {
        if !self.link.is_connected() {
            return Err(self.transport_error(LinkError::Disconnected));
        }
        let callback: NotificationCallback = self.monitor.callback();
        self.link()
            .subscribe(Characteristic::STATUS, callback)
            .map_err(|source| self.transport_error(source))?;
        self.write_control(ControlOpcode::Start)?;

        let mut handshake = StartHandshake::new(self.policy.max_start_retries);
        loop {
            self.check_abort()?;
            let event = match self.monitor.await_next(self.policy.status_timeout) {
                Ok(raw) => match self.decode(&raw) {
                    Some(status) => HandshakeEvent::Status(status),
                    None => HandshakeEvent::Malformed,
                },
                Err(_) => HandshakeEvent::Timeout,
            };

            match handshake.on_event(event) {
                HandshakeStep::Waiting => {}
                HandshakeStep::Ready => return Ok(()),
                HandshakeStep::PeerError(status) => {
                    if self.config.abort_on_peer_error {
                        return Err(self.peer_error(status));
                    }
                }
                HandshakeStep::Exhausted { attempts } => {
                    return Err(FotaError::Timeout {
                        stage: Stage::Starting,
                        attempts,
                        timeout_ms: self.policy.status_timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Send the whole image, then check for residual sync loss.
    ///
    /// A SYNC_LOST found by the post-transfer status read sends the session
    /// back to Transferring from the peer's fragment id, up to
    /// `max_resync_attempts` times.
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub fn transfer(&mut self, image: &FirmwareImage) -> Result<()> {
        self.expect_stage(Stage::Transferring)?;
        info!(
            bytes = image.len(),
            frames = image.frame_count(self.config.fragment_size),
            "Starting firmware binary transfer"
        );

        let mut machine = TransferMachine::new(image, self.config.fragment_size);
        let mut resyncs = 0;
        loop {
            let result = self.pump(&mut machine);
            self.guard(result)?;

            self.goto(SessionState::Verifying);
            let result = self.check_sync();
            let Some(fragment_id) = self.guard(result)? else {
                info!(frames = machine.frames_written(), "Transfer complete");
                return Ok(());
            };

            if resyncs >= self.policy.max_resync_attempts {
                return Err(self.fail(FotaError::Desynchronization {
                    fragment_id,
                    attempts: resyncs,
                }));
            }
            resyncs += 1;

            machine.resume_from(fragment_id);
            self.emit(FotaEvent::Rewound {
                fragment_id,
                packet_number: machine.sequencer().packet_number(),
            });
            self.goto(SessionState::Transferring { paused: false });
        }
    }

    /// Write COMMIT. The session is Done once the peer accepted it.
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.expect_stage(Stage::Verifying)?;
        self.goto(SessionState::Committing);

        let result = self.write_control(ControlOpcode::Commit);
        self.guard(result)?;

        self.emit(FotaEvent::Complete);
        self.goto(SessionState::Done);
        Ok(())
    }

    fn pump(&mut self, machine: &mut TransferMachine<'_>) -> Result<()> {
        loop {
            self.check_abort()?;

            // At most one notification per iteration; only a paused
            // machine blocks for it.
            let pending = if machine.is_paused() {
                self.monitor.await_next(self.policy.pause_poll).ok()
            } else {
                self.monitor.try_take()
            };
            if let Some(raw) = pending {
                self.apply_status(machine, &raw)?;
            }

            match machine.next_action() {
                TransferAction::Complete => return Ok(()),
                TransferAction::Wait => {}
                TransferAction::Send(fragment) => self.send_fragment(machine, &fragment)?,
            }
        }
    }

    fn apply_status(&mut self, machine: &mut TransferMachine<'_>, raw: &[u8]) -> Result<()> {
        let Some(status) = self.decode(raw) else {
            return Ok(());
        };

        let was_paused = machine.is_paused();
        match machine.on_status(&status) {
            Disposition::Continue => {}
            Disposition::Paused { fragment_id }
            | Disposition::Resumed { fragment_id }
            | Disposition::Resynchronized { fragment_id } => {
                self.emit(FotaEvent::Rewound {
                    fragment_id,
                    packet_number: machine.sequencer().packet_number(),
                });
            }
            Disposition::PeerError(code) => {
                self.log(
                    LogLevel::Warn,
                    format!("Peer reported {code} at {}", machine.sequencer()),
                );
                if self.config.abort_on_peer_error {
                    return Err(self.peer_error(code));
                }
            }
        }

        if machine.is_paused() != was_paused {
            self.goto(SessionState::Transferring {
                paused: machine.is_paused(),
            });
        }
        Ok(())
    }

    fn send_fragment(
        &mut self,
        machine: &mut TransferMachine<'_>,
        fragment: &Fragment<'_>,
    ) -> Result<()> {
        let frame = fragment.to_frame();
        debug!(
            packet = fragment.packet_number,
            id = fragment.fragment_id,
            sent = machine.bytes_sent(),
            total = machine.total_bytes(),
            "Sending packet"
        );

        let result = self.link().write(
            Characteristic::BINARY_STREAM,
            &frame,
            false,
            self.policy.write_timeout,
        );

        match result {
            Ok(()) => {
                machine.on_write_ok(fragment);
                self.last_packet = Some(fragment.packet_number);
                self.emit(FotaEvent::FragmentSent {
                    packet_number: fragment.packet_number,
                    fragment_id: fragment.fragment_id,
                    len: fragment.payload.len(),
                });
                self.emit(FotaEvent::Progress {
                    sent: machine.bytes_sent() as u64,
                    total: machine.total_bytes() as u64,
                });
                sleep(self.policy.pacing_delay);
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                let consecutive = machine.on_write_timeout();
                warn!(packet = fragment.packet_number, consecutive, "Timeout writing binary stream");
                self.emit(FotaEvent::WriteTimeout {
                    packet_number: fragment.packet_number,
                    consecutive,
                });
                if self.policy.write_timeouts_exhausted(consecutive) {
                    return Err(FotaError::Timeout {
                        stage: Stage::Transferring,
                        attempts: consecutive,
                        timeout_ms: self.policy.write_timeout.as_millis() as u64,
                    });
                }
                sleep(self.policy.write_backoff);
                Ok(())
            }
            Err(source) => Err(FotaError::Transport {
                stage: Stage::Transferring,
                packet_number: Some(fragment.packet_number),
                source,
            }),
        }
    }

    /// Synchronous status read; `Some(id)` when the peer is out of sync.
    fn check_sync(&mut self) -> Result<Option<u8>> {
        let raw = self
            .link()
            .read(Characteristic::STATUS)
            .map_err(|source| self.transport_error(source))?;
        let status = StatusNotification::parse(&raw).map_err(|source| {
            FotaError::ProtocolViolation {
                stage: Stage::Verifying,
                source,
            }
        })?;
        self.record_status(status);

        match status.code {
            StatusCode::SyncLost => {
                warn!(fragment_id = ?status.fragment_id, "Transfer ended with sync lost condition");
                Ok(status.fragment_id)
            }
            code if code.is_peer_error() && self.config.abort_on_peer_error => {
                Err(self.peer_error(code))
            }
            _ => Ok(None),
        }
    }

    fn write_control(&self, opcode: ControlOpcode) -> Result<()> {
        info!(opcode = %opcode, "Writing control opcode");
        self.link()
            .write(
                Characteristic::CONTROL,
                &[opcode.as_byte()],
                true,
                self.policy.control_timeout,
            )
            .map_err(|source| self.transport_error(source))
    }

    fn check_abort(&self) -> Result<()> {
        if !self.abort.is_aborted() {
            return Ok(());
        }
        if let Err(e) = self.write_control(ControlOpcode::Stop) {
            warn!(error = %e, "Failed to send STOP after abort");
        }
        Err(FotaError::Aborted {
            stage: self.state.stage(),
            packet_number: self.last_packet,
        })
    }

    fn decode(&mut self, raw: &[u8]) -> Option<StatusNotification> {
        match StatusNotification::parse(raw) {
            Ok(status) => {
                self.record_status(status);
                Some(status)
            }
            Err(e) => {
                warn!(raw = ?raw, error = %e, "Protocol violation in status notification");
                self.log(LogLevel::Warn, format!("Ignoring malformed status: {e}"));
                None
            }
        }
    }

    fn record_status(&mut self, status: StatusNotification) {
        self.last_status = Some(status);
        self.emit(FotaEvent::StatusReceived { status });
    }

    fn expect_stage(&self, expected: Stage) -> Result<()> {
        let actual = self.state.stage();
        if actual == expected {
            Ok(())
        } else {
            Err(FotaError::InvalidState { expected, actual })
        }
    }

    fn goto(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, "State transition");
        self.emit(FotaEvent::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    /// Enter `Failed`, reporting stage and last known position.
    fn fail(&mut self, err: FotaError) -> FotaError {
        error!(
            stage = %self.state.stage(),
            last_packet = ?self.last_packet,
            last_status = ?self.last_status.map(|s| s.to_string()),
            error = %err,
            "FOTA session failed"
        );
        self.emit(FotaEvent::Error {
            message: err.to_string(),
        });
        self.goto(SessionState::Failed(err.kind()));
        err
    }

    fn transport_error(&self, source: LinkError) -> FotaError {
        FotaError::Transport {
            stage: self.state.stage(),
            packet_number: self.last_packet,
            source,
        }
    }

    fn peer_error(&self, status: StatusCode) -> FotaError {
        FotaError::PeerReported {
            stage: self.state.stage(),
            status,
            packet_number: self.last_packet,
        }
    }

    fn link(&self) -> ObservableLink<'_, L, O> {
        ObservableLink {
            inner: &self.link,
            observer: &self.observer,
        }
    }

    fn emit(&self, event: FotaEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FotaEvent::Log {
            level,
            message: message.into(),
        });
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Link wrapper that emits packet events.
struct ObservableLink<'a, L: Link, O: FotaObserver> {
    inner: &'a L,
    observer: &'a Arc<O>,
}

fn channel_name(characteristic: Characteristic) -> &'static str {
    if characteristic == Characteristic::BINARY_STREAM {
        "binary-stream"
    } else if characteristic == Characteristic::CONTROL {
        "control"
    } else if characteristic == Characteristic::STATUS {
        "status"
    } else {
        "other"
    }
}

impl<L: Link, O: FotaObserver> Link for ObservableLink<'_, L, O> {
    fn subscribe(
        &self,
        characteristic: Characteristic,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        self.inner.subscribe(characteristic, callback)
    }

    fn write(
        &self,
        characteristic: Characteristic,
        data: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let res = self.inner.write(characteristic, data, with_response, timeout);
        if res.is_ok() {
            self.observer.on_event(&FotaEvent::Packet {
                direction: PacketDirection::Tx,
                channel: channel_name(characteristic),
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
        let res = self.inner.read(characteristic);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&FotaEvent::Packet {
                direction: PacketDirection::Rx,
                channel: channel_name(characteristic),
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read_descriptor(
        &self,
        characteristic: Characteristic,
        descriptor: Uuid,
    ) -> Result<Option<Vec<u8>>, LinkError> {
        self.inner.read_descriptor(characteristic, descriptor)
    }

    fn has_characteristic(&self, characteristic: Characteristic) -> bool {
        self.inner.has_characteristic(characteristic)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::state::FailureKind;
    use crate::transport::MockLink;
    use std::time::Instant;

    const START: u8 = 0x01;
    const XON: [u8; 2] = [0x03, 0];

    fn fast_config() -> SessionConfig {
        SessionConfig {
            status_timeout_ms: 20,
            ..SessionConfig::fast()
        }
    }

    fn session(mock: &MockLink) -> FotaSession<MockLink, RecordingObserver> {
        FotaSession::with_observer(mock.clone(), fast_config(), Arc::new(RecordingObserver::new()))
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes((0..len).map(|i| (i % 253) as u8).collect()).unwrap()
    }

    fn started(mock: &MockLink) -> FotaSession<MockLink, RecordingObserver> {
        mock.notify_on_control(START, &XON);
        let mut session = session(mock);
        session.start().unwrap();
        session
    }

    #[test]
    fn test_start_subscribes_then_writes_start() {
        let mock = MockLink::new();
        let session = started(&mock);

        assert!(mock.is_subscribed());
        assert_eq!(mock.writes_to(Characteristic::CONTROL), vec![vec![START]]);
        assert_eq!(session.state(), SessionState::Transferring { paused: false });
    }

    #[test]
    fn test_start_times_out_after_max_retries() {
        let mock = MockLink::new();
        let mut session = session(&mock);

        let began = Instant::now();
        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            FotaError::Timeout {
                stage: Stage::Starting,
                attempts: 6,
                ..
            }
        ));
        assert!(began.elapsed() >= Duration::from_millis(6 * 20));
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Timeout));

        // Failed is terminal.
        let image = image(10);
        assert!(matches!(
            session.transfer(&image),
            Err(FotaError::InvalidState { .. })
        ));
        assert!(matches!(session.start(), Err(FotaError::InvalidState { .. })));
    }

    #[test]
    fn test_start_waits_through_xoff_notifications() {
        let mock = MockLink::new();
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                status_timeout_ms: 2_000,
                ..SessionConfig::fast()
            },
            Arc::new(RecordingObserver::new()),
        );
        let monitor = session.monitor().clone();
        let feeder = {
            let mock = mock.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !mock.is_subscribed() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                for payload in [[0x02, 0], [0x02, 0], [0x03, 0]] {
                    mock.notify(&payload);
                    while monitor.has_pending() && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };

        session.start().unwrap();
        feeder.join().unwrap();
        assert_eq!(session.state(), SessionState::Transferring { paused: false });
        assert_eq!(
            session.last_status(),
            Some(StatusNotification::with_fragment(StatusCode::Xon, 0))
        );
    }

    #[test]
    fn test_start_peer_error_aborts_when_configured() {
        let mock = MockLink::new();
        mock.notify_on_control(START, &[0x0b]);
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                abort_on_peer_error: true,
                ..fast_config()
            },
            Arc::new(NullObserver),
        );

        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            FotaError::PeerReported {
                status: StatusCode::NoFotaSession,
                ..
            }
        ));
    }

    #[test]
    fn test_transfer_300_bytes() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        let image = image(300);

        session.transfer(&image).unwrap();
        session.commit().unwrap();

        let frames = mock.writes_to(Characteristic::BINARY_STREAM);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| (f[0], f.len() - 1)).collect::<Vec<_>>(),
            vec![(0, 128), (1, 128), (2, 44)]
        );
        assert_eq!(
            mock.writes_to(Characteristic::CONTROL),
            vec![vec![START], vec![0x03]]
        );
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.last_packet(), Some(2));
    }

    #[test]
    fn test_binary_writes_are_unacknowledged() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        session.transfer(&image(10)).unwrap();

        for write in mock.get_writes() {
            let expect_response = write.characteristic == Characteristic::CONTROL;
            assert_eq!(write.with_response, expect_response);
        }
    }

    #[test]
    fn test_write_timeout_retries_same_fragment() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.timeout_stream_write(2);

        session.transfer(&image(300)).unwrap();

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_consecutive_write_timeouts_fail() {
        let mock = MockLink::new();
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                max_consecutive_write_timeouts: 3,
                ..fast_config()
            },
            Arc::new(RecordingObserver::new()),
        );
        mock.notify_on_control(START, &XON);
        session.start().unwrap();
        for n in 1..=4 {
            mock.timeout_stream_write(n);
        }

        let err = session.transfer(&image(300)).unwrap_err();
        assert!(matches!(
            err,
            FotaError::Timeout {
                stage: Stage::Transferring,
                attempts: 4,
                ..
            }
        ));
        assert_eq!(mock.stream_write_count(), 4);
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Timeout));
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.fail_stream_write(3);

        let err = session.transfer(&image(1000)).unwrap_err();
        assert!(matches!(
            err,
            FotaError::Transport {
                stage: Stage::Transferring,
                packet_number: Some(2),
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Transport));
    }

    #[test]
    fn test_xoff_pauses_until_xon() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        // Peer buffer fills after fragment 4.
        mock.notify_after_stream_write(5, &[0x02, 5]);

        let releaser = {
            let mock = mock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                let writes_while_paused = mock.stream_write_count();
                mock.notify(&[0x03, 5]);
                writes_while_paused
            })
        };

        session.transfer(&image(1000)).unwrap();
        let writes_while_paused = releaser.join().unwrap();
        assert_eq!(writes_while_paused, 5);

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_paused_session_applies_each_notification() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.notify_after_stream_write(2, &[0x02, 2]);
        let monitor = session.monitor().clone();

        let feeder = {
            let mock = mock.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                let wait_taken = |value: &[u8]| {
                    while (monitor.latest() != value || monitor.has_pending())
                        && Instant::now() < deadline
                    {
                        thread::sleep(Duration::from_millis(1));
                    }
                };
                wait_taken(&[0x02, 2]);
                mock.notify(&[0x02, 1]);
                wait_taken(&[0x02, 1]);
                let writes_while_paused = mock.stream_write_count();
                mock.notify(&[0x03, 1]);
                writes_while_paused
            })
        };

        session.transfer(&image(800)).unwrap();
        assert_eq!(feeder.join().unwrap(), 2);

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_xoff_rewind_resends_fragment() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        // Peer only stored up to fragment 3 when it ran out of room.
        mock.notify_after_stream_write(5, &[0x02, 4]);

        let releaser = {
            let mock = mock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                mock.notify(&[0x03, 4]);
            })
        };

        session.transfer(&image(1000)).unwrap();
        releaser.join().unwrap();

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 4, 5, 6, 7]);
    }

    #[test]
    fn test_sync_lost_rewinds_without_pause() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.notify_after_stream_write(4, &[0x04, 2]);

        session.transfer(&image(800)).unwrap();

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_write_timeout_budget_allows_exactly_max_in_a_row() {
        let mock = MockLink::new();
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                max_consecutive_write_timeouts: 3,
                ..fast_config()
            },
            Arc::new(NullObserver),
        );
        mock.notify_on_control(START, &XON);
        session.start().unwrap();
        for n in 1..=3 {
            mock.timeout_stream_write(n);
        }

        session.transfer(&image(10)).unwrap();
        assert_eq!(mock.stream_write_count(), 4);
    }

    #[test]
    fn test_sync_lost_after_final_write_resends() {
        let mock = MockLink::new();
        let observer = Arc::new(RecordingObserver::new());
        mock.notify_on_control(START, &XON);
        let mut session =
            FotaSession::with_observer(mock.clone(), fast_config(), observer.clone());
        session.start().unwrap();
        // Arrives with the final fragment; the status read stays OK.
        mock.notify_after_stream_write(3, &[0x04, 1]);

        session.transfer(&image(300)).unwrap();

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 1, 2]);
        assert!(observer.events().contains(&FotaEvent::Rewound {
            fragment_id: 1,
            packet_number: 1
        }));
        assert_eq!(session.state(), SessionState::Verifying);
    }

    #[test]
    fn test_post_transfer_sync_lost_resumes() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.queue_read(Characteristic::STATUS, &[0x04, 1]);
        mock.queue_read(Characteristic::STATUS, &[0x00]);

        session.transfer(&image(300)).unwrap();
        session.commit().unwrap();

        let ids: Vec<u8> = mock
            .writes_to(Characteristic::BINARY_STREAM)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 1, 2]);
    }

    #[test]
    fn test_persistent_sync_loss_fails() {
        let mock = MockLink::new();
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                max_resync_attempts: 1,
                ..fast_config()
            },
            Arc::new(RecordingObserver::new()),
        );
        mock.notify_on_control(START, &XON);
        session.start().unwrap();
        mock.queue_read(Characteristic::STATUS, &[0x04, 0]);
        mock.queue_read(Characteristic::STATUS, &[0x04, 0]);

        let err = session.transfer(&image(300)).unwrap_err();
        assert!(matches!(
            err,
            FotaError::Desynchronization {
                fragment_id: 0,
                attempts: 1
            }
        ));
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureKind::Desynchronization)
        );
        assert!(mock.writes_to(Characteristic::CONTROL).len() == 1);
    }

    #[test]
    fn test_malformed_post_transfer_status_is_protocol_violation() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.queue_read(Characteristic::STATUS, &[0x7f]);

        let err = session.transfer(&image(10)).unwrap_err();
        assert!(matches!(err, FotaError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_peer_error_logged_by_default() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.notify_after_stream_write(1, &[0x06]);

        session.transfer(&image(300)).unwrap();
        assert_eq!(mock.writes_to(Characteristic::BINARY_STREAM).len(), 3);
    }

    #[test]
    fn test_peer_error_aborts_when_configured() {
        let mock = MockLink::new();
        mock.notify_on_control(START, &XON);
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                abort_on_peer_error: true,
                ..fast_config()
            },
            Arc::new(RecordingObserver::new()),
        );
        session.start().unwrap();
        mock.notify_after_stream_write(1, &[0x0a]);

        let err = session.transfer(&image(300)).unwrap_err();
        assert!(matches!(
            err,
            FotaError::PeerReported {
                stage: Stage::Transferring,
                status: StatusCode::HardwareError,
                packet_number: Some(0),
            }
        ));
    }

    #[test]
    fn test_malformed_notification_is_ignored() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        mock.notify_after_stream_write(1, &[0xee, 0x01]);

        session.transfer(&image(300)).unwrap();
        assert_eq!(mock.writes_to(Characteristic::BINARY_STREAM).len(), 3);
    }

    #[test]
    fn test_abort_sends_stop() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        session.abort_handle().abort();

        let err = session.transfer(&image(300)).unwrap_err();
        assert!(matches!(err, FotaError::Aborted { .. }));
        assert_eq!(
            mock.writes_to(Characteristic::CONTROL),
            vec![vec![START], vec![0x02]]
        );
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Aborted));
    }

    #[test]
    fn test_commit_requires_verified_transfer() {
        let mock = MockLink::new();
        let mut session = started(&mock);
        assert!(matches!(
            session.commit(),
            Err(FotaError::InvalidState {
                expected: Stage::Verifying,
                actual: Stage::Transferring
            })
        ));
    }

    #[test]
    fn test_state_sequence_is_reported() {
        let mock = MockLink::new();
        mock.notify_on_control(START, &XON);
        let observer = Arc::new(RecordingObserver::new());
        let mut session =
            FotaSession::with_observer(mock.clone(), fast_config(), observer.clone());

        session.run(&image(200)).unwrap();

        assert_eq!(
            observer.states(),
            vec![
                SessionState::Starting,
                SessionState::Transferring { paused: false },
                SessionState::Verifying,
                SessionState::Committing,
                SessionState::Done,
            ]
        );
        assert!(observer.events().contains(&FotaEvent::Progress {
            sent: 200,
            total: 200
        }));
    }

    #[test]
    fn test_packets_are_reported_to_observer() {
        let mock = MockLink::new();
        mock.notify_on_control(START, &XON);
        let observer = Arc::new(RecordingObserver::new());
        let mut session =
            FotaSession::with_observer(mock.clone(), fast_config(), observer.clone());

        session.run(&image(200)).unwrap();

        let packets: Vec<(PacketDirection, &'static str, usize)> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FotaEvent::Packet {
                    direction,
                    channel,
                    length,
                    ..
                } => Some((direction, channel, length)),
                _ => None,
            })
            .collect();
        assert_eq!(
            packets,
            vec![
                (PacketDirection::Tx, "control", 1),
                (PacketDirection::Tx, "binary-stream", 129),
                (PacketDirection::Tx, "binary-stream", 73),
                (PacketDirection::Rx, "status", 1),
                (PacketDirection::Tx, "control", 1),
            ]
        );
    }

    #[test]
    fn test_get_firmware_revision_reads_through_session() {
        let mock = MockLink::new();
        mock.queue_read(Characteristic::DIS_FIRMWARE_REVISION, b"3.2");
        let observer = Arc::new(RecordingObserver::new());
        let session = FotaSession::with_observer(mock.clone(), fast_config(), observer.clone());

        let identity = session.get_firmware_revision().unwrap();
        assert_eq!(identity.revision, "3.2");
        assert_eq!(identity.description, None);
        assert!(observer.events().contains(&FotaEvent::Packet {
            direction: PacketDirection::Rx,
            channel: "other",
            length: 3,
            data: Some(b"3.2".to_vec()),
        }));
    }

    #[test]
    fn test_start_on_disconnected_link_fails() {
        let mock = MockLink::new();
        mock.disconnect();
        let mut session = session(&mock);

        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            FotaError::Transport {
                stage: Stage::Starting,
                source: LinkError::Disconnected,
                ..
            }
        ));
        assert!(!mock.is_subscribed());
        assert!(mock.get_writes().is_empty());
        assert_eq!(session.state(), SessionState::Failed(FailureKind::Transport));
    }

    #[test]
    fn test_invalid_config_fails_start() {
        let mock = MockLink::new();
        let mut session = FotaSession::with_observer(
            mock.clone(),
            SessionConfig {
                fragment_size: 0,
                ..fast_config()
            },
            Arc::new(RecordingObserver::new()),
        );
        assert!(matches!(session.start(), Err(FotaError::Config(_))));
        assert!(mock.get_writes().is_empty());
    }
}
