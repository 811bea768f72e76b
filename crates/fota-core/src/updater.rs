//! Full update orchestration: connect, record the firmware identity, run a
//! session, wait for the peer to reboot and confirm the revision changed.

use std::sync::Arc;
use std::thread;

use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::error::{FotaError, Result};
use crate::events::{FotaEvent, FotaObserver, TracingObserver};
use crate::identity::{FirmwareIdentity, UpdateOutcome, read_firmware_identity, verify_update};
use crate::payload::FirmwareImage;
use crate::session::{AbortHandle, FotaSession};
use crate::state::SessionState;
use crate::transport::DeviceConnector;

/// Summary of one completed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub outcome: UpdateOutcome,
    /// Bytes handed to the peer.
    pub bytes: usize,
    /// Connection attempts spent waiting for the reboot.
    pub reconnect_attempts: u32,
}

impl UpdateReport {
    pub fn before(&self) -> &FirmwareIdentity {
        match &self.outcome {
            UpdateOutcome::Applied { before, .. } => before,
            UpdateOutcome::Unchanged(identity) => identity,
        }
    }

    pub fn after(&self) -> &FirmwareIdentity {
        match &self.outcome {
            UpdateOutcome::Applied { after, .. } => after,
            UpdateOutcome::Unchanged(identity) => identity,
        }
    }
}

pub struct FirmwareUpdater<C: DeviceConnector, O: FotaObserver> {
    connector: C,
    config: SessionConfig,
    observer: Arc<O>,
    abort: AbortHandle,
    last_state: Option<SessionState>,
}

impl<C: DeviceConnector> FirmwareUpdater<C, TracingObserver> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self::with_observer(connector, config, Arc::new(TracingObserver))
    }
}

impl<C: DeviceConnector, O: FotaObserver> FirmwareUpdater<C, O> {
    pub fn with_observer(connector: C, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            connector,
            config,
            observer,
            abort: AbortHandle::default(),
            last_state: None,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle that aborts the session of the current or next run.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Final state of the last session, if one ran.
    pub fn last_state(&self) -> Option<SessionState> {
        self.last_state
    }

    /// Push `image` to the configured device and confirm the update.
    ///
    /// The link is released whether or not the session succeeds. A session
    /// failure is returned as is, without attempting to reconnect.
    #[instrument(skip(self, image), fields(device = %self.config.device_name, bytes = image.len()))]
    pub fn run(&mut self, image: &FirmwareImage) -> Result<UpdateReport> {
        self.config.validate()?;
        let name = self.config.device_name.clone();

        let link = self
            .connector
            .connect(&name)?
            .ok_or_else(|| FotaError::DeviceNotFound { name: name.clone() })?;
        self.emit(FotaEvent::DeviceConnected { name: name.clone() });

        let before = match read_firmware_identity(&link) {
            Ok(identity) => identity,
            Err(e) => {
                self.release(link);
                return Err(e);
            }
        };
        info!(revision = %before, "Firmware before update");

        let mut session =
            FotaSession::with_observer(link, self.config.clone(), self.observer.clone())
                .with_abort_handle(self.abort.clone());
        let result = session.run(image);
        self.last_state = Some(session.state());
        self.release(session.into_link());
        result?;

        let (after, reconnect_attempts) = self.reconnect_and_identify(&name)?;
        let outcome = verify_update(before, after);
        if !outcome.is_applied() {
            warn!("Peer came back with the same firmware revision");
        }

        Ok(UpdateReport {
            outcome,
            bytes: image.len(),
            reconnect_attempts,
        })
    }

    /// Poll until the rebooted peer accepts a connection, then read its
    /// identity.
    fn reconnect_and_identify(&mut self, name: &str) -> Result<(FirmwareIdentity, u32)> {
        let interval = self.config.reconnect_interval();
        let retries = self.config.reconnect_retries;

        for attempt in 1..=retries {
            thread::sleep(interval);
            info!(attempt, max = retries, "Reconnecting after commit");
            let link = match self.connector.connect(name) {
                Ok(Some(link)) => link,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, attempt, "Reconnect attempt failed");
                    continue;
                }
            };
            self.emit(FotaEvent::DeviceConnected {
                name: name.to_string(),
            });
            let identity = read_firmware_identity(&link);
            self.release(link);
            return identity.map(|identity| (identity, attempt));
        }

        Err(FotaError::ReconnectFailed {
            name: name.to_string(),
            attempts: retries,
        })
    }

    fn release(&mut self, link: C::Link) {
        self.connector.release(link);
        self.emit(FotaEvent::DeviceReleased);
    }

    fn emit(&self, event: FotaEvent) {
        self.observer.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::state::FailureKind;
    use crate::transport::{Link, PeripheralBehavior, SimulatedConnector, SimulatedPeripheral};

    fn updater(
        behavior: PeripheralBehavior,
    ) -> FirmwareUpdater<SimulatedConnector, RecordingObserver> {
        let config = SessionConfig {
            device_name: behavior.name.clone(),
            fragment_size: behavior.fragment_size,
            ..SessionConfig::fast()
        };
        let connector = SimulatedConnector::new(SimulatedPeripheral::new(behavior));
        FirmwareUpdater::with_observer(connector, config, Arc::new(RecordingObserver::new()))
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_bytes((0..len).map(|i| (i % 251) as u8).collect()).unwrap()
    }

    #[test]
    fn test_update_applies_new_revision() {
        let mut updater = updater(PeripheralBehavior::default());
        let image = image(1000);

        let report = updater.run(&image).unwrap();

        assert!(report.outcome.is_applied());
        assert_eq!(report.before().revision, "1.0.0");
        assert_eq!(report.after().revision, "1.1.0");
        assert_eq!(report.bytes, 1000);
        assert_eq!(report.reconnect_attempts, 2);
        assert_eq!(updater.last_state(), Some(SessionState::Done));
        assert_eq!(
            updater.connector().peripheral().installed_image().as_deref(),
            Some(image.raw_data())
        );
    }

    #[test]
    fn test_unknown_device() {
        let mut updater = updater(PeripheralBehavior::default());
        updater.config.device_name = "Nobody".into();
        assert!(matches!(
            updater.run(&image(10)),
            Err(FotaError::DeviceNotFound { name }) if name == "Nobody"
        ));
        assert_eq!(updater.last_state(), None);
    }

    #[test]
    fn test_session_failure_releases_link() {
        let mut updater = updater(PeripheralBehavior {
            accept_start: false,
            ..PeripheralBehavior::default()
        });

        let err = updater.run(&image(10)).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(
            updater.last_state(),
            Some(SessionState::Failed(FailureKind::Timeout))
        );
        assert!(!updater.connector().peripheral().is_connected());
        assert_eq!(
            updater.observer.events().last(),
            Some(&FotaEvent::DeviceReleased)
        );
    }

    #[test]
    fn test_reboot_outlasting_retries() {
        let mut updater = updater(PeripheralBehavior {
            reboot_polls: 10,
            ..PeripheralBehavior::default()
        });
        updater.config.reconnect_retries = 3;

        assert!(matches!(
            updater.run(&image(10)),
            Err(FotaError::ReconnectFailed { attempts: 3, .. })
        ));
        assert_eq!(updater.last_state(), Some(SessionState::Done));
    }
}
