use std::sync::Arc;
use std::time::Duration;

use hub_common::connections::{SimulatedConnector, SimulatedDevice};
use hub_common::{ConnectionResilienceManager, DeviceError, DeviceSettings, DeviceStateSource, ExtensionValue};
use tokio_util::sync::CancellationToken;

fn settings() -> DeviceSettings {
    DeviceSettings {
        reconnect_interval_ms: 1_000,
        connection_timeout_ms: 500,
        ..DeviceSettings::default()
    }
}

fn manager(device: &Arc<SimulatedDevice>, token: &CancellationToken) -> Arc<ConnectionResilienceManager> {
    let connector = Arc::new(SimulatedConnector::new(device.clone()));
    Arc::new(ConnectionResilienceManager::new(settings(), connector, token))
}

#[tokio::test(start_paused = true)]
async fn mixed_concurrent_calls_open_one_session() {
    let token = CancellationToken::new();
    let device = SimulatedDevice::seeded(&settings());
    device.set_connect_delay(Duration::from_millis(200));
    let mgr = manager(&device, &token);

    let mut tasks = Vec::new();
    for i in 0..24 {
        let mgr = mgr.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if i % 3 == 0 {
                mgr.write_state("conveyor", &format!("{{\"cmd\":{i}}}")).await.map(|_| ())
            } else {
                mgr.read_state(&token).await.map(|_| ())
            }
        }));
    }
    for t in tasks {
        assert!(t.await.unwrap().is_ok());
    }

    assert_eq!(device.connect_attempts(), 1);
    assert_eq!(mgr.retry_tasks_started(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_failures_share_one_retry_which_rearms_after_recovery() {
    let token = CancellationToken::new();
    let device = SimulatedDevice::seeded(&settings());
    device.set_reachable(false);
    let mgr = manager(&device, &token);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let mgr = mgr.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move { mgr.read_state(&token).await }));
    }
    for t in tasks {
        assert!(t.await.unwrap().unwrap_err().is_transport());
    }
    assert!(mgr.is_retrying());
    assert_eq!(mgr.retry_tasks_started(), 1);

    device.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(mgr.is_live());
    assert!(!mgr.is_retrying());

    // The proxy drops again: the next call fails and a fresh retry starts.
    device.set_reachable(false);
    assert!(mgr.read_state(&token).await.is_err());
    assert!(mgr.is_retrying());
    assert_eq!(mgr.retry_tasks_started(), 2);

    mgr.close().await;
    assert!(!mgr.is_retrying());
}

#[tokio::test(start_paused = true)]
async fn process_shutdown_stops_the_retry() {
    let root = CancellationToken::new();
    let device = SimulatedDevice::seeded(&settings());
    device.set_reachable(false);
    let mgr = manager(&device, &root);

    assert!(mgr.read_state(&root).await.is_err());
    assert!(mgr.is_retrying());

    root.cancel();
    assert!(!mgr.is_retrying());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(device.connect_attempts(), 1);
    assert!(matches!(mgr.read_state(&root).await, Err(DeviceError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn writes_reach_the_control_tag_and_rejections_are_final() {
    let token = CancellationToken::new();
    let cfg = settings();
    let device = SimulatedDevice::seeded(&cfg);
    let mgr = manager(&device, &token);
    let control = cfg.node_id(&cfg.tags.control_command);

    mgr.write_state("conveyor", r#"{"action":"start"}"#).await.unwrap();
    assert_eq!(
        device.written(&control),
        Some(ExtensionValue::Text(r#"{"action":"start"}"#.to_string()))
    );

    device.set_read_only(&control);
    let err = mgr.write_state("conveyor", "stop").await.unwrap_err();
    assert!(matches!(err, DeviceError::WriteRejected { .. }));
    assert!(mgr.is_live());
    assert_eq!(mgr.retry_tasks_started(), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_manager_refuses_further_calls() {
    let token = CancellationToken::new();
    let device = SimulatedDevice::seeded(&settings());
    let mgr = manager(&device, &token);
    mgr.read_state(&token).await.unwrap();

    mgr.close().await;
    mgr.close().await;

    assert!(!mgr.is_live());
    assert!(matches!(mgr.read_state(&token).await, Err(DeviceError::NotConnected)));
    assert!(matches!(
        mgr.write_state("conveyor", "start").await,
        Err(DeviceError::NotConnected)
    ));
}
