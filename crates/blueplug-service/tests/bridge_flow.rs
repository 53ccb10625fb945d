//! Publish bridge behaviour against the mock broker.

use std::time::Duration;

use rumqttc::QoS;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};

use blueplug_core::RetryConfig;
use blueplug_service::mock::MockBroker;
use blueplug_service::{
    BridgeHandle, BridgeOptions, BrokerState, OverflowPolicy, TopicMapper, spawn_bridge,
};
use blueplug_types::{DeviceIdentity, Measurement, Reading, ReadingSource, Unit, uuids};

fn reading(metric: &str) -> Reading {
    Reading::from_measurement(
        DeviceIdentity::new("d1"),
        ReadingSource::Characteristic {
            service: uuids::ENVIRONMENTAL_SENSING_SERVICE,
            characteristic: uuids::TEMPERATURE,
        },
        Measurement::new(metric, 21.0, Unit::Celsius),
        OffsetDateTime::now_utc(),
    )
}

fn options() -> BridgeOptions {
    BridgeOptions::default().reconnect(
        RetryConfig::new(u32::MAX)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(false),
    )
}

fn start(broker: &MockBroker, options: BridgeOptions) -> BridgeHandle {
    spawn_bridge(
        broker.clone(),
        TopicMapper::new("test", QoS::AtLeastOnce, false),
        options,
    )
}

async fn wait_delivered(broker: &MockBroker, count: usize) {
    timeout(Duration::from_secs(60), async {
        while broker.delivered().len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for deliveries");
}

async fn wait_state(bridge: &BridgeHandle, matches: impl Fn(&BrokerState) -> bool) {
    let mut status = bridge.subscribe_status();
    timeout(Duration::from_secs(60), status.wait_for(|s| matches(&s.state)))
        .await
        .expect("timed out waiting for broker state")
        .expect("bridge stopped");
}

#[tokio::test(start_paused = true)]
async fn test_outage_queue_flushes_in_order_after_reconnect() {
    let broker = MockBroker::new();
    broker.fail_next_connects(3);
    let bridge = start(&broker, options());

    for metric in ["r1", "r2", "r3"] {
        bridge.publish(reading(metric));
    }

    wait_state(&bridge, |s| matches!(s, BrokerState::Degraded { .. })).await;
    assert_eq!(bridge.status().queued, 3);
    assert!(broker.delivered().is_empty());

    wait_state(&bridge, |s| *s == BrokerState::Connected).await;
    bridge.publish(reading("r4"));
    bridge.publish(reading("r5"));

    wait_delivered(&broker, 5).await;
    assert_eq!(
        broker.delivered_topics(),
        ["test/D1/r1", "test/D1/r2", "test/D1/r3", "test/D1/r4", "test/D1/r5"]
    );
    assert_eq!(broker.connect_attempts(), 4);

    let status = bridge.status();
    assert_eq!(status.queued, 0);
    assert!(status.last_publish.is_some());

    let report = bridge.shutdown().await;
    assert_eq!(report.delivered, 5);
    assert_eq!(report.undelivered, 0);
    assert_eq!(broker.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_publish_is_retried_once() {
    let broker = MockBroker::new();
    broker.fail_next_publishes(1);
    let bridge = start(&broker, options());

    for metric in ["a", "b", "c"] {
        bridge.publish(reading(metric));
    }

    wait_delivered(&broker, 3).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(
        broker.delivered_topics(),
        ["test/D1/a", "test/D1/b", "test/D1/c"]
    );
    assert_eq!(broker.connect_attempts(), 2);
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_oldest() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1000);
    let bridge = start(
        &broker,
        options()
            .queue_capacity(2)
            .overflow(OverflowPolicy::DropOldest),
    );

    for i in 0..5 {
        bridge.publish(reading(&format!("r{i}")));
    }

    let mut status = bridge.subscribe_status();
    timeout(Duration::from_secs(60), status.wait_for(|s| s.dropped == 3))
        .await
        .expect("timed out waiting for drops")
        .expect("bridge stopped");
    assert_eq!(bridge.status().queued, 2);

    let report = bridge.shutdown().await;
    assert_eq!(report.dropped, 3);
    assert_eq!(report.undelivered, 2);
    assert_eq!(report.delivered, 0);
    assert_eq!(broker.disconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_reported_and_retried() {
    let broker = MockBroker::new();
    broker.reject_next_connects(2);
    let bridge = start(&broker, options());

    wait_state(&bridge, |s| {
        matches!(s, BrokerState::Degraded { reason } if reason.contains("rejected"))
    })
    .await;
    wait_state(&bridge, |s| *s == BrokerState::Connected).await;
    assert_eq!(broker.connect_attempts(), 3);

    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_link_loss_reconnects() {
    let broker = MockBroker::new();
    let bridge = start(&broker, options());
    wait_state(&bridge, |s| *s == BrokerState::Connected).await;

    broker.drop_connection();
    timeout(Duration::from_secs(60), async {
        while broker.connect_attempts() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bridge did not reconnect");

    bridge.publish(reading("after"));
    wait_delivered(&broker, 1).await;
    assert_eq!(broker.delivered_topics(), ["test/D1/after"]);
    bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flush_stops_at_deadline() {
    let broker = MockBroker::new();
    broker.set_ack_latency(Duration::from_secs(1));
    let bridge = start(
        &broker,
        options().flush_timeout(Duration::from_millis(2500)),
    );
    wait_state(&bridge, |s| *s == BrokerState::Connected).await;

    for i in 0..5 {
        bridge.publish(reading(&format!("r{i}")));
    }
    let mut status = bridge.subscribe_status();
    let report = bridge.shutdown().await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.undelivered, 3);
    assert_eq!(broker.delivered_topics(), ["test/D1/r0", "test/D1/r1"]);
    assert_eq!(status.borrow_and_update().state, BrokerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_disconnected_skips_flush() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1000);
    let bridge = start(&broker, options());
    bridge.publish(reading("stuck"));
    wait_state(&bridge, |s| matches!(s, BrokerState::Degraded { .. })).await;

    let report = timeout(Duration::from_secs(1), bridge.shutdown())
        .await
        .expect("shutdown waited for the backoff timer");
    assert_eq!(report.undelivered, 1);
}
