use std::sync::Arc;
use std::time::Duration;

use hub_common::connections::{SimulatedConnector, SimulatedDevice};
use hub_common::ingestors::{PollError, DEFAULT_GROUP, STATE_EVENT};
use hub_common::{
    ConnectionResilienceManager, DeviceError, DeviceSettings, Dispatcher, ExtensionValue,
    PollingSettings, StateAggregator, StatePollingLoop,
};
use project_tests::{bag, RecordingPush, ScriptedSource};
use tokio_util::sync::CancellationToken;

fn polling() -> PollingSettings {
    PollingSettings {
        interval_ms: 500,
        backoff_ceiling_ms: 2_000,
    }
}

fn healthy() -> hub_common::core::ExtensionMap {
    bag(&[
        ("deviceName", "Line_A".into()),
        ("deviceStatus", "Online".into()),
        ("opc.conveyor.speed", ExtensionValue::Number(0.5)),
    ])
}

#[tokio::test(start_paused = true)]
async fn failed_tick_backs_off_then_resumes_the_interval() {
    let source = Arc::new(ScriptedSource::new(healthy()));
    source.push_ok(healthy());
    source.push_err(DeviceError::Transport("connection reset by peer".into()));

    let push = Arc::new(RecordingPush::new());
    let aggregator = Arc::new(StateAggregator::new());
    let poll = StatePollingLoop::new(source.clone(), aggregator.clone(), push.clone(), polling());

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { poll.run(token).await }
    });

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    token.cancel();
    let stats = handle.await.unwrap();

    // ok at 0, failure at 500, backoff of 2 x 500, then the normal cadence.
    let offsets: Vec<u64> = source
        .read_offsets()
        .iter()
        .map(|d| d.as_millis() as u64)
        .collect();
    assert_eq!(offsets, vec![0, 500, 1_500, 2_000]);
    assert_eq!(stats.ticks_ok, 3);
    assert_eq!(stats.ticks_failed, 1);

    let frames = push.to_group(DEFAULT_GROUP);
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.event == STATE_EVENT));
    assert_eq!(aggregator.version(), 3);
}

#[tokio::test]
async fn failed_tick_keeps_the_last_good_state() {
    let source = Arc::new(ScriptedSource::new(healthy()));
    source.push_ok(bag(&[
        ("opc.conveyor.speed", ExtensionValue::Number(0.5)),
        ("ros.tick", ExtensionValue::Number(1.0)),
    ]));
    source.push_err(DeviceError::Transport("connection reset by peer".into()));
    source.push_ok(bag(&[("opc.conveyor.speed", ExtensionValue::Number(0.9))]));

    let push = Arc::new(RecordingPush::new());
    let aggregator = Arc::new(StateAggregator::new());
    let poll = StatePollingLoop::new(source.clone(), aggregator.clone(), push.clone(), polling());
    let token = CancellationToken::new();

    let first = poll.tick(&token).await.unwrap();
    assert_eq!(first.sequence(), 1);

    let err = poll.tick(&token).await.unwrap_err();
    assert!(matches!(err, PollError::Device(DeviceError::Transport(_))));
    assert!(Arc::ptr_eq(&first, &aggregator.snapshot()));

    let third = poll.tick(&token).await.unwrap();
    assert_eq!(third.sequence(), 2);
    assert_eq!(third.extensions["opc.conveyor.speed"], ExtensionValue::Number(0.9));
    // Keys the latest read did not mention survive the merge.
    assert_eq!(third.extensions["ros.tick"], ExtensionValue::Number(1.0));

    assert_eq!(push.to_group(DEFAULT_GROUP).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn pipeline_recovers_when_the_proxy_comes_back() {
    let settings = DeviceSettings {
        reconnect_interval_ms: 1_000,
        connection_timeout_ms: 500,
        ..DeviceSettings::default()
    };
    let token = CancellationToken::new();
    let device = SimulatedDevice::seeded(&settings);
    device.set_reachable(false);

    let connector = Arc::new(SimulatedConnector::new(device.clone()));
    let manager = Arc::new(ConnectionResilienceManager::new(settings.clone(), connector, &token));

    let dispatcher = Arc::new(Dispatcher::new());
    let mut rx = dispatcher.add_client("panel-1");
    assert!(dispatcher.join_group("panel-1", DEFAULT_GROUP));

    let aggregator = Arc::new(StateAggregator::new());
    let poll = StatePollingLoop::new(manager.clone(), aggregator.clone(), dispatcher.clone(), polling());
    let handle = tokio::spawn({
        let token = token.clone();
        async move { poll.run(token).await }
    });

    // Failures at 0 and 1000; nothing is published while the proxy is down.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(aggregator.snapshot().device_status, "Unknown");
    assert!(manager.is_retrying());

    device.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.event, STATE_EVENT);
    assert_eq!(frame.payload["deviceStatus"], "Online");
    assert_eq!(frame.payload["deviceName"], settings.device_name());
    assert_eq!(frame.payload["extensions"]["opc.conveyor.running"], true);
    assert!(manager.is_live());

    token.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.ticks_failed, 2);
    assert!(stats.ticks_ok >= 1);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn readers_never_see_the_sequence_go_backwards() {
    let source = Arc::new(ScriptedSource::new(healthy()));
    let aggregator = Arc::new(StateAggregator::new());
    let poll = StatePollingLoop::new(
        source,
        aggregator.clone(),
        Arc::new(RecordingPush::new()),
        PollingSettings {
            interval_ms: 10,
            backoff_ceiling_ms: 100,
        },
    );

    let token = CancellationToken::new();
    let poller = tokio::spawn({
        let token = token.clone();
        async move { poll.run(token).await }
    });

    // A second writer merging another namespace alongside the poll loop.
    let writer = tokio::spawn({
        let aggregator = aggregator.clone();
        async move {
            for i in 0..50 {
                aggregator.merge(&bag(&[("ros.tick", ExtensionValue::Number(i as f64))]));
                tokio::time::sleep(Duration::from_millis(7)).await;
            }
        }
    });

    let mut last = 0;
    for _ in 0..200 {
        let seen = aggregator.snapshot().sequence();
        assert!(seen >= last, "sequence went from {last} to {seen}");
        last = seen;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    writer.await.unwrap();
    token.cancel();
    let stats = poller.await.unwrap();

    let final_state = aggregator.snapshot();
    assert_eq!(final_state.extensions["ros.tick"], ExtensionValue::Number(49.0));
    assert_eq!(final_state.device_status, "Online");
    assert_eq!(aggregator.version(), stats.ticks_ok + 50);
}
