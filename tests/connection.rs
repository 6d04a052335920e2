mod common;

use std::time::Duration;

use common::{connected_rig, scripted_rig, settle};
use stringart_link::{
    ConnectionManager, ConnectionState, LinkError, RigError, Status, StatusBoard,
    TransportConfig,
};

#[tokio::test(start_paused = true)]
async fn connect_reaches_connected_and_reports_device() {
    let (rig, peripheral) = scripted_rig(TransportConfig::default());
    assert_eq!(rig.state(), ConnectionState::Disconnected);

    let device = rig.connect().await.unwrap();
    assert_eq!(device.label(), "StringArt");
    assert_eq!(rig.state(), ConnectionState::Connected);
    assert_eq!(rig.device(), Some(device));
    assert_eq!(
        rig.status(),
        Status::Connected {
            device: "StringArt".into()
        }
    );
    assert_eq!(peripheral.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_is_rejected_unless_disconnected() {
    let (rig, peripheral) = scripted_rig(TransportConfig::default());

    let (first, second) = tokio::join!(rig.connect(), async {
        settle().await;
        assert_eq!(rig.state(), ConnectionState::Connecting);
        assert!(rig.controls_locked());
        rig.connect().await
    });
    assert!(first.is_ok());
    assert!(matches!(second, Err(RigError::Busy(_))));

    assert!(matches!(rig.connect().await, Err(RigError::Busy(_))));
    assert_eq!(peripheral.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_discovery_returns_to_disconnected() {
    let (rig, peripheral) = scripted_rig(TransportConfig::default());
    peripheral.fail_next_open(RigError::Discovery("user cancelled".into()));

    let err = rig.connect().await.unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(rig.state(), ConnectionState::Disconnected);
    assert_eq!(rig.status(), Status::DiscoveryCancelled);
    assert!(!rig.status().is_error());

    // A later attempt is allowed again.
    rig.connect().await.unwrap();
    assert_eq!(rig.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn link_failure_is_reported_as_error() {
    let (rig, peripheral) = scripted_rig(TransportConfig::default());
    peripheral.fail_next_open(RigError::Link(LinkError::CharacteristicNotFound(
        "0000ffe1".into(),
    )));

    assert!(matches!(
        rig.connect().await,
        Err(RigError::Link(LinkError::CharacteristicNotFound(_)))
    ));
    assert_eq!(rig.state(), ConnectionState::Disconnected);
    assert!(rig.status().is_error());
}

#[tokio::test(start_paused = true)]
async fn disconnect_goes_through_the_close_event() {
    let (rig, _peripheral) = connected_rig(TransportConfig::default()).await;

    rig.disconnect().await.unwrap();
    settle().await;
    assert_eq!(rig.state(), ConnectionState::Disconnected);
    assert_eq!(rig.device(), None);
    assert_eq!(rig.status(), Status::Disconnected);

    assert!(matches!(rig.disconnect().await, Err(RigError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn remote_disconnect_clears_the_link() {
    let (rig, peripheral) = connected_rig(TransportConfig::default()).await;

    peripheral.drop_link();
    settle().await;
    assert_eq!(rig.state(), ConnectionState::Disconnected);

    // Reconnecting yields a fresh link.
    rig.connect().await.unwrap();
    assert_eq!(rig.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn write_requires_a_link_and_failed_writes_drop_it() {
    let peripheral = common::Peripheral::new();
    let conn = ConnectionManager::new(
        common::ScriptedConnector {
            peripheral: peripheral.clone(),
        },
        StatusBoard::new(),
    );

    assert!(matches!(
        conn.write(b"START\n").await,
        Err(LinkError::NotConnected)
    ));

    conn.connect().await.unwrap();
    conn.write(b"START\n").await.unwrap();
    assert_eq!(peripheral.received(), "START\n");

    peripheral.fail_writes();
    assert!(matches!(conn.write(b"PAUSE\n").await, Err(LinkError::Write(_))));
    settle().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_subscribers() {
    let peripheral = common::Peripheral::new();
    let conn = ConnectionManager::new(
        common::ScriptedConnector {
            peripheral: peripheral.clone(),
        },
        StatusBoard::new(),
    );
    conn.connect().await.unwrap();

    let mut rx = conn.subscribe_notifications();
    peripheral.notify("All sequences complete.");
    let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "All sequences complete.");
}
