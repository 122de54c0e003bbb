mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{board, Harness, MockCatalog, MICROPYTHON_VID, OTHER_VID};
use micro_repl_lib::serial::interface::{Parity, PortParameters};
use micro_repl_lib::{ConnectionStatus, FailureCode, ReplSettings};

#[tokio::test]
async fn no_devices_reports_connecting_then_no_devices() {
    let mut h = Harness::new(MockCatalog::with_devices(Vec::new()));
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert_eq!(h.next_status().await.failure_code(), Some(FailureCode::NoDevices));
    assert!(h.quiet_for(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn only_unknown_vendors_reports_not_supported() {
    let catalog = MockCatalog::with_devices(vec![board(OTHER_VID, "/dev/ttyUSB0"), board(0x0403, "/dev/ttyUSB1")]);
    let mut h = Harness::new(catalog.clone());
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert_eq!(h.next_status().await.failure_code(), Some(FailureCode::NotSupported));
    assert_eq!(catalog.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn supported_board_connects_with_repl_port_profile() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    let mut h = Harness::new(catalog.clone());
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    match h.next_status().await {
        ConnectionStatus::Connected { board } => {
            assert_eq!(board.port, "/dev/ttyACM0");
            assert_eq!(board.board, "MicroPython - Board in FS mode");
            assert!(board.is_micropython);
        }
        other => panic!("expected Connected, got {:?}", other),
    }

    let params = catalog.probe.params.lock().unwrap().clone().expect("parameters not applied");
    assert_eq!(
        params,
        PortParameters {
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    );
    assert!(catalog.probe.dtr.load(Ordering::SeqCst), "DTR must be asserted");
    assert!(h.manager.session().await.is_some());
}

#[tokio::test]
async fn first_supported_device_in_enumeration_order_wins() {
    let catalog = MockCatalog::with_devices(vec![
        board(OTHER_VID, "/dev/ttyUSB0"),
        board(MICROPYTHON_VID, "/dev/ttyACM1"),
        board(MICROPYTHON_VID, "/dev/ttyACM2"),
    ]);
    let h = Harness::connected(catalog.clone()).await;

    match h.manager.status().await {
        ConnectionStatus::Connected { board } => assert_eq!(board.port, "/dev/ttyACM1"),
        other => panic!("expected Connected, got {:?}", other),
    }
    assert_eq!(catalog.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn secondary_allow_listed_vendor_is_not_flagged_as_micropython() {
    let catalog = MockCatalog::with_devices(vec![board(9114, "/dev/ttyACM0")]);
    let settings = ReplSettings {
        supported_vendors: vec![MICROPYTHON_VID, 9114],
        ..common::test_settings()
    };
    let mut h = Harness::with_settings(catalog, settings);
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    match h.next_status().await {
        ConnectionStatus::Connected { board } => assert!(!board.is_micropython),
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_driver_fails_with_cant_open_port() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    catalog.no_drivers.store(true, Ordering::SeqCst);
    let mut h = Harness::new(catalog.clone());
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert_eq!(h.next_status().await.failure_code(), Some(FailureCode::CantOpenPort));
    assert_eq!(catalog.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dtr_failure_fails_with_cant_open_port_and_closes_port() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    catalog.probe.fail_dtr.store(true, Ordering::SeqCst);
    let mut h = Harness::new(catalog.clone());
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert_eq!(h.next_status().await.failure_code(), Some(FailureCode::CantOpenPort));
    assert!(!catalog.probe.is_open());
    assert!(h.manager.session().await.is_none());
}

#[tokio::test]
async fn port_closed_after_start_fails_with_cant_open_port() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    catalog.probe.closed_after_start.store(true, Ordering::SeqCst);
    let mut h = Harness::new(catalog);
    h.manager.start().await;

    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert_eq!(h.next_status().await.failure_code(), Some(FailureCode::CantOpenPort));
}

#[tokio::test]
async fn teardown_without_connecting_is_harmless() {
    let h = Harness::new(MockCatalog::with_devices(Vec::new()));
    h.manager.teardown().await;
    h.manager.teardown().await;
}

#[tokio::test]
async fn teardown_closes_open_port() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    let h = Harness::connected(catalog.clone()).await;

    h.manager.teardown().await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while catalog.probe.is_open() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("port still open after teardown");
    assert!(h.manager.session().await.is_none());
}

#[tokio::test]
async fn restarting_while_connected_shuts_down_previous_session() {
    let catalog = MockCatalog::with_devices(vec![board(MICROPYTHON_VID, "/dev/ttyACM0")]);
    let mut h = Harness::connected(catalog.clone()).await;
    let previous = h.manager.session().await.expect("no session after connect");

    h.manager.start().await;
    assert_eq!(h.next_status().await, ConnectionStatus::Connecting);
    assert!(h.next_status().await.is_connected());
    assert_eq!(catalog.opened.load(Ordering::SeqCst), 2);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !previous.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("previous session still running after reconnect");
    assert!(!h.manager.session().await.unwrap().is_closed());
}
