//! Full sessions against the simulated peripheral.

use std::sync::Arc;
use std::time::Duration;

use fota_core::transport::{PeripheralBehavior, SimulatedConnector, SimulatedPeripheral};
use fota_core::{
    FirmwareImage, FirmwareUpdater, FotaEvent, FotaSession, RecordingObserver, SessionConfig,
    SessionState,
};

fn image(len: usize) -> FirmwareImage {
    FirmwareImage::from_bytes((0..len).map(|i| (i * 7 % 256) as u8).collect()).unwrap()
}

fn config(fragment_size: usize) -> SessionConfig {
    SessionConfig {
        fragment_size,
        ..SessionConfig::fast()
    }
}

fn run_session(
    behavior: PeripheralBehavior,
    image: &FirmwareImage,
) -> (SimulatedPeripheral, Arc<RecordingObserver>, fota_core::Result<()>) {
    let peer = SimulatedPeripheral::new(PeripheralBehavior {
        fragment_size: 128,
        ..behavior
    });
    let observer = Arc::new(RecordingObserver::new());
    let mut session = FotaSession::with_observer(peer.clone(), config(128), observer.clone());
    let result = session.run(image);
    (peer, observer, result)
}

fn sent_ids(observer: &RecordingObserver) -> Vec<u8> {
    observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            FotaEvent::FragmentSent { fragment_id, .. } => Some(fragment_id),
            _ => None,
        })
        .collect()
}

#[test]
fn test_small_image_is_installed() {
    let image = image(300);
    let (peer, observer, result) = run_session(PeripheralBehavior::default(), &image);

    result.unwrap();
    assert_eq!(sent_ids(&observer), vec![0, 1, 2]);
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
    assert_eq!(observer.states().last(), Some(&SessionState::Done));
}

#[test]
fn test_exact_multiple_sends_empty_terminal_frame() {
    let image = image(256);
    let (peer, observer, result) = run_session(PeripheralBehavior::default(), &image);

    result.unwrap();
    assert_eq!(sent_ids(&observer), vec![0, 1, 2]);
    assert_eq!(peer.installed_image().map(|i| i.len()), Some(256));
}

#[test]
fn test_xoff_pauses_and_resumes() {
    let image = image(128 * 8 + 10);
    let (peer, observer, result) = run_session(
        PeripheralBehavior {
            xoff_after: Some(4),
            pause: Duration::from_millis(30),
            ..PeripheralBehavior::default()
        },
        &image,
    );

    result.unwrap();
    assert_eq!(sent_ids(&observer), (0..=8).collect::<Vec<u8>>());
    assert_eq!(peer.frames_received(), 9);
    assert!(
        observer
            .states()
            .contains(&SessionState::Transferring { paused: true })
    );
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
}

#[test]
fn test_dropped_packet_is_resent_after_sync_lost() {
    let image = image(128 * 6 + 1);
    let (peer, observer, result) = run_session(
        PeripheralBehavior {
            drop_packet: Some(2),
            ..PeripheralBehavior::default()
        },
        &image,
    );

    result.unwrap();
    assert_eq!(sent_ids(&observer), vec![0, 1, 2, 3, 2, 3, 4, 5, 6]);
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
}

#[test]
fn test_silent_sync_loss_is_recovered_after_transfer() {
    let image = image(128 * 4 + 1);
    let (peer, observer, result) = run_session(
        PeripheralBehavior {
            drop_packet: Some(1),
            silent_sync_loss: true,
            ..PeripheralBehavior::default()
        },
        &image,
    );

    result.unwrap();
    assert_eq!(sent_ids(&observer), vec![0, 1, 2, 3, 4, 1, 2, 3, 4]);
    assert!(observer.states().contains(&SessionState::Verifying));
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
}

#[test]
fn test_fragment_ids_roll_over() {
    let image = image(128 * 300 + 5);
    let (peer, observer, result) = run_session(PeripheralBehavior::default(), &image);

    result.unwrap();
    let ids = sent_ids(&observer);
    assert_eq!(ids.len(), 301);
    assert_eq!(ids[255], 255);
    assert_eq!(ids[256], 0);
    assert_eq!(ids[300], 44);
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
}

#[test]
fn test_sync_lost_across_rollover() {
    let image = image(128 * 270);
    let (peer, observer, result) = run_session(
        PeripheralBehavior {
            drop_packet: Some(258),
            ..PeripheralBehavior::default()
        },
        &image,
    );

    result.unwrap();
    let ids = sent_ids(&observer);
    assert_eq!(&ids[257..261], &[1, 2, 3, 2]);
    assert_eq!(peer.installed_image().as_deref(), Some(image.raw_data()));
}

#[test]
fn test_updater_confirms_new_revision() {
    let behavior = PeripheralBehavior {
        description: Some("application core".into()),
        reboot_polls: 2,
        ..PeripheralBehavior::default()
    };
    let config = SessionConfig {
        device_name: behavior.name.clone(),
        ..SessionConfig::fast()
    };
    let connector = SimulatedConnector::new(SimulatedPeripheral::new(behavior));
    let mut updater = FirmwareUpdater::new(connector, config);

    let report = updater.run(&image(2000)).unwrap();

    assert!(report.outcome.is_applied());
    assert_eq!(report.before().to_string(), "1.0.0 for device \"application core\"");
    assert_eq!(report.after().revision, "1.1.0");
    assert_eq!(report.reconnect_attempts, 3);
}

#[test]
fn test_updater_reports_unchanged_revision() {
    let behavior = PeripheralBehavior {
        fota_scoped_revision: false,
        updated_revision: "1.0.0".into(),
        ..PeripheralBehavior::default()
    };
    let config = SessionConfig {
        device_name: behavior.name.clone(),
        ..SessionConfig::fast()
    };
    let connector = SimulatedConnector::new(SimulatedPeripheral::new(behavior));
    let mut updater = FirmwareUpdater::new(connector, config);

    let report = updater.run(&image(10)).unwrap();
    assert!(!report.outcome.is_applied());
    assert_eq!(report.after().description, None);
}
