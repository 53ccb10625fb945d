//! End-to-end runs of the coordinator against the mock adapter and broker.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use blueplug_core::mock::{MockAdapter, MockPeripheral};
use blueplug_core::{
    Advertisement, CharProps, DecoderRegistry, RetryConfig, ScanOptions, SessionOptions, uuids,
};
use blueplug_service::config::DeviceConfig;
use blueplug_service::mock::MockBroker;
use blueplug_service::{
    BridgeOptions, Coordinator, CoordinatorOptions, ShutdownReport, TopicMapper, spawn_bridge,
};

const SENSOR: &str = "AA:BB:CC:DD:EE:FF";

/// BTHome v2: temperature 25.06 °C, humidity 50.55 %.
const BTHOME_PAYLOAD: [u8; 9] = [0x40, 0x00, 0x07, 0x02, 0xCA, 0x09, 0x03, 0xBF, 0x13];

struct Harness {
    adapter: Arc<MockAdapter>,
    broker: MockBroker,
    stop: CancellationToken,
    task: JoinHandle<blueplug_core::Result<ShutdownReport>>,
}

impl Harness {
    fn start(adapter: Arc<MockAdapter>, options: CoordinatorOptions) -> Self {
        let broker = MockBroker::new();
        let bridge = spawn_bridge(
            broker.clone(),
            TopicMapper::new("test", QoS::AtLeastOnce, false),
            BridgeOptions::default(),
        );
        let coordinator = Coordinator::new(
            adapter.clone(),
            DecoderRegistry::with_builtin(),
            bridge,
            options,
        );
        let stop = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(stop.clone().cancelled_owned()));
        Self {
            adapter,
            broker,
            stop,
            task,
        }
    }

    async fn scanning(&self) {
        eventually(|| self.adapter.is_scanning()).await;
    }

    async fn stop(self) -> ShutdownReport {
        self.stop.cancel();
        timeout(Duration::from_secs(30), self.task)
            .await
            .expect("coordinator did not stop")
            .expect("coordinator task panicked")
            .expect("coordinator failed")
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn options() -> CoordinatorOptions {
    CoordinatorOptions::default()
        .session(
            SessionOptions::default()
                .connect_timeout(Duration::from_secs(1))
                .discovery_timeout(Duration::from_secs(1))
                .retry(
                    RetryConfig::new(2)
                        .initial_delay(Duration::from_millis(10))
                        .jitter(false),
                ),
        )
        .shutdown_timeout(Duration::from_secs(2))
}

fn humidity_sensor(id: &str) -> Arc<MockPeripheral> {
    Arc::new(
        MockPeripheral::new(id)
            .with_service(
                uuids::ENVIRONMENTAL_SENSING_SERVICE,
                [(uuids::HUMIDITY, CharProps::READ)],
            )
            .with_value(uuids::HUMIDITY, [0xC6, 0x11]),
    )
}

fn ess_advertisement(id: &str) -> Advertisement {
    Advertisement::new(id).with_service(uuids::ENVIRONMENTAL_SENSING_SERVICE)
}

#[tokio::test]
async fn test_unavailable_adapter_fails_startup() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.set_unavailable(true);
    let harness = Harness::start(adapter.clone(), options());

    let result = timeout(Duration::from_secs(5), harness.task)
        .await
        .expect("coordinator did not return")
        .expect("coordinator task panicked");

    let error = result.expect_err("startup should fail");
    assert!(error.is_adapter_unavailable());
    assert_eq!(adapter.scan_starts(), 0);
    assert_eq!(adapter.connect_attempts(), 0);
    assert_eq!(harness.broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_repeated_advertisements_share_one_session() {
    let adapter = Arc::new(MockAdapter::new());
    let sensor = humidity_sensor(SENSOR);
    adapter.add_peripheral(sensor.clone());
    let harness = Harness::start(adapter.clone(), options());
    harness.scanning().await;

    let advertisement = ess_advertisement(SENSOR);
    for _ in 0..5 {
        assert!(adapter.advertise(advertisement.clone()));
    }

    eventually(|| !harness.broker.delivered().is_empty()).await;
    assert_eq!(
        harness.broker.delivered_topics()[0],
        "test/AA:BB:CC:DD:EE:FF/humidity"
    );
    let payload: serde_json::Value =
        serde_json::from_slice(&harness.broker.delivered()[0].payload).unwrap();
    assert_eq!(payload["value"], 45.5);
    assert_eq!(payload["device"], SENSOR);

    // Another sighting only confirms presence.
    assert!(adapter.advertise(ess_advertisement(SENSOR)));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.connect_attempts(), 1);
    assert_eq!(sensor.connect_count(), 1);

    let report = harness.stop().await;
    assert_eq!(report.sessions, 1);
    assert_eq!(report.sessions_aborted, 0);
    assert!(report.bridge.delivered >= 1);
    assert!(!sensor.is_connected());
}

#[tokio::test]
async fn test_passive_advertisement_is_published_without_connecting() {
    let adapter = Arc::new(MockAdapter::new());
    let harness = Harness::start(adapter.clone(), options());
    harness.scanning().await;

    assert!(adapter.advertise(
        Advertisement::new(SENSOR).with_service_data(uuids::BTHOME_SERVICE, BTHOME_PAYLOAD)
    ));

    eventually(|| harness.broker.delivered().len() >= 2).await;
    let mut topics = harness.broker.delivered_topics();
    topics.sort();
    assert_eq!(
        topics,
        [
            "test/AA:BB:CC:DD:EE:FF/humidity",
            "test/AA:BB:CC:DD:EE:FF/temperature"
        ]
    );
    assert_eq!(adapter.connect_attempts(), 0);

    let report = harness.stop().await;
    assert_eq!(report.sessions, 0);
    assert_eq!(report.bridge.delivered, 2);
}

#[tokio::test]
async fn test_configured_alias_is_used_in_topics() {
    let adapter = Arc::new(MockAdapter::new());
    let devices = vec![DeviceConfig {
        address: None,
        name: Some("Attic*".to_string()),
        alias: Some("attic".to_string()),
    }];
    let harness = Harness::start(adapter.clone(), options().devices(devices));
    harness.scanning().await;

    assert!(
        adapter.advertise(
            Advertisement::new(SENSOR)
                .with_name("Attic Sensor")
                .with_service_data(uuids::BTHOME_SERVICE, BTHOME_PAYLOAD)
        )
    );

    eventually(|| harness.broker.delivered().len() >= 2).await;
    assert!(
        harness
            .broker
            .delivered_topics()
            .contains(&"test/attic/temperature".to_string())
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_advertised_name_labels_unaliased_device() {
    let adapter = Arc::new(MockAdapter::new());
    let harness = Harness::start(
        adapter.clone(),
        options().scan_options(ScanOptions::default().dedup_window(Duration::ZERO)),
    );
    harness.scanning().await;

    assert!(
        adapter.advertise(
            Advertisement::new(SENSOR)
                .with_name("ATC_4F2A")
                .with_service_data(uuids::BTHOME_SERVICE, BTHOME_PAYLOAD)
        )
    );
    eventually(|| harness.broker.delivered().len() >= 2).await;

    // A later name change does not move the device to another topic.
    assert!(
        adapter.advertise(
            Advertisement::new(SENSOR)
                .with_name("Renamed Sensor")
                .with_service_data(uuids::BTHOME_SERVICE, BTHOME_PAYLOAD)
        )
    );
    eventually(|| harness.broker.delivered().len() >= 4).await;

    let mut topics = harness.broker.delivered_topics();
    topics.sort();
    topics.dedup();
    assert_eq!(
        topics,
        ["test/ATC_4F2A/humidity", "test/ATC_4F2A/temperature"]
    );
    harness.stop().await;
}

#[tokio::test]
async fn test_scan_restarts_after_stream_ends() {
    let adapter = Arc::new(MockAdapter::new());
    let harness = Harness::start(
        adapter.clone(),
        options().scan_restart(
            RetryConfig::for_scan()
                .initial_delay(Duration::from_millis(50))
                .jitter(false),
        ),
    );
    harness.scanning().await;
    assert_eq!(adapter.scan_starts(), 1);

    adapter.end_scan();
    eventually(|| adapter.scan_starts() == 2 && adapter.is_scanning()).await;

    let sensor = humidity_sensor(SENSOR);
    adapter.add_peripheral(sensor.clone());
    assert!(adapter.advertise(ess_advertisement(SENSOR)));
    eventually(|| !harness.broker.delivered().is_empty()).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_session_limit_is_respected() {
    let adapter = Arc::new(MockAdapter::new());
    let first = humidity_sensor("11:11:11:11:11:11");
    let second = humidity_sensor("22:22:22:22:22:22");
    adapter.add_peripheral(first.clone());
    adapter.add_peripheral(second.clone());
    let harness = Harness::start(adapter.clone(), options().max_sessions(1));
    harness.scanning().await;

    assert!(adapter.advertise(ess_advertisement("11:11:11:11:11:11")));
    eventually(|| !harness.broker.delivered().is_empty()).await;

    assert!(adapter.advertise(ess_advertisement("22:22:22:22:22:22")));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(second.connect_count(), 0);
    assert_eq!(adapter.max_concurrent_connects(), 1);

    let report = harness.stop().await;
    assert_eq!(report.sessions, 1);
}

#[tokio::test]
async fn test_abandoned_session_is_evicted_and_readmitted() {
    let adapter = Arc::new(MockAdapter::new());
    let device_name = uuids::from_short(0x2A00);
    let sensor = Arc::new(MockPeripheral::new(SENSOR).with_service(
        uuids::ENVIRONMENTAL_SENSING_SERVICE,
        [(device_name, CharProps::READ)],
    ));
    adapter.add_peripheral(sensor.clone());
    let harness = Harness::start(
        adapter.clone(),
        options().scan_options(ScanOptions::default().dedup_window(Duration::ZERO)),
    );
    harness.scanning().await;

    assert!(adapter.advertise(ess_advertisement(SENSOR)));
    eventually(|| sensor.connect_count() == 1 && !sensor.is_connected()).await;

    // Give the coordinator time to see the abandonment.
    sleep(Duration::from_millis(50)).await;
    assert!(adapter.advertise(ess_advertisement(SENSOR)));
    eventually(|| sensor.connect_count() == 2).await;

    let report = harness.stop().await;
    assert!(report.sessions <= 1);
    assert_eq!(report.bridge.delivered, 0);
}
