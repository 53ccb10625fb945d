//! Session lifecycle tests over the mock radio.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use blueplug_core::mock::{MockAdapter, MockPeripheral};
use blueplug_core::{
    AbandonReason, CharProps, DecoderRegistry, Reading, ReportReceiver, RetryConfig,
    SessionContext, SessionHandle, SessionOptions, SessionPhase, SessionReport, report_channel,
    spawn_session, uuids,
};

const TEMP_23_14: [u8; 2] = [0x0A, 0x09];
const HUMIDITY_45_5: [u8; 2] = [0xC6, 0x11];

struct Harness {
    adapter: Arc<MockAdapter>,
    context: SessionContext,
    reports: ReportReceiver,
    readings: mpsc::UnboundedReceiver<Reading>,
    root: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        // RUST_LOG=blueplug_core=debug shows the session transitions
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let adapter = Arc::new(MockAdapter::new());
        let (readings_tx, readings) = mpsc::unbounded_channel();
        let (reports_tx, reports) = report_channel();
        let context = SessionContext::new(
            adapter.clone(),
            Arc::new(DecoderRegistry::with_builtin()),
            readings_tx,
            reports_tx,
        );
        Self {
            adapter,
            context,
            reports,
            readings,
            root: CancellationToken::new(),
        }
    }

    fn add(&self, peripheral: MockPeripheral) -> Arc<MockPeripheral> {
        let peripheral = Arc::new(peripheral);
        self.adapter.add_peripheral(peripheral.clone());
        peripheral
    }

    fn spawn(&self, peripheral: &MockPeripheral, options: SessionOptions) -> SessionHandle {
        spawn_session(
            peripheral.identity().clone(),
            self.context.clone(),
            options,
            &self.root,
        )
    }

    async fn next_report(&mut self) -> SessionReport {
        timeout(Duration::from_secs(120), self.reports.recv())
            .await
            .expect("timed out waiting for a session report")
            .expect("report channel closed")
    }

    /// Collect reports up to and including the next transition into `phase`.
    async fn until_phase(&mut self, phase: SessionPhase) -> Vec<SessionReport> {
        let mut seen = Vec::new();
        loop {
            let report = self.next_report().await;
            let done = matches!(&report, SessionReport::StateChanged { to, .. } if *to == phase);
            seen.push(report);
            if done {
                return seen;
            }
        }
    }

    async fn until_abandoned(&mut self) -> AbandonReason {
        loop {
            if let SessionReport::Abandoned { reason, .. } = self.next_report().await {
                return reason;
            }
        }
    }

    async fn next_reading(&mut self) -> Reading {
        timeout(Duration::from_secs(120), self.readings.recv())
            .await
            .expect("timed out waiting for a reading")
            .expect("reading channel closed")
    }
}

fn ess_sensor(id: &str) -> MockPeripheral {
    MockPeripheral::new(id)
        .with_service(
            uuids::ENVIRONMENTAL_SENSING_SERVICE,
            [
                (uuids::TEMPERATURE, CharProps::NOTIFY),
                (uuids::HUMIDITY, CharProps::READ),
            ],
        )
        .with_value(uuids::HUMIDITY, HUMIDITY_45_5)
}

fn options() -> SessionOptions {
    SessionOptions::default()
        .connect_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_secs(3600))
        .liveness_interval(Duration::from_secs(3600))
        .retry(
            RetryConfig::new(2)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(4))
                .jitter(false),
        )
}

#[tokio::test]
async fn test_streams_notifications_and_initial_reads() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:01"));
    let _session = h.spawn(&sensor, options());

    let reports = h.until_phase(SessionPhase::Streaming).await;
    let phases: Vec<_> = reports
        .iter()
        .filter_map(|r| match r {
            SessionReport::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            SessionPhase::Connecting,
            SessionPhase::ServiceDiscovery,
            SessionPhase::Subscribing,
            SessionPhase::Streaming,
        ]
    );
    assert!(sensor.is_subscribed(uuids::TEMPERATURE));

    // Read-only characteristic is read once during setup
    let humidity = h.next_reading().await;
    assert_eq!(humidity.metric, "humidity");
    assert!((humidity.value - 45.5).abs() < 1e-9);

    assert!(sensor.notify(uuids::TEMPERATURE, TEMP_23_14));
    let temperature = h.next_reading().await;
    assert_eq!(temperature.metric, "temperature");
    assert_eq!(temperature.device, *sensor.identity());
    assert!((temperature.value - 23.14).abs() < 1e-9);
}

#[tokio::test]
async fn test_malformed_notification_keeps_streaming() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:02"));
    let _session = h.spawn(&sensor, options());
    h.until_phase(SessionPhase::Streaming).await;
    h.next_reading().await;

    assert!(sensor.notify(uuids::TEMPERATURE, [0x01]));
    match h.next_report().await {
        SessionReport::DecodeFailed { characteristic, .. } => {
            assert_eq!(characteristic, uuids::TEMPERATURE);
        }
        other => panic!("expected a decode failure, got {other:?}"),
    }

    assert!(sensor.notify(uuids::TEMPERATURE, TEMP_23_14));
    assert_eq!(h.next_reading().await.metric, "temperature");
    assert!(sensor.is_connected());
    assert!(h.reports.try_recv().is_err());
}

#[tokio::test]
async fn test_no_matching_characteristics_abandons_without_retry() {
    let mut h = Harness::new();
    let sensor = h.add(
        MockPeripheral::new("AA:00:00:00:00:03")
            .with_service(uuids::from_short(0x1812), [(uuids::from_short(0x2A4D), CharProps::READ_NOTIFY)]),
    );
    let session = h.spawn(&sensor, options());

    let reports = h.until_phase(SessionPhase::Abandoned).await;
    assert!(!reports.iter().any(|r| matches!(
        r,
        SessionReport::StateChanged {
            to: SessionPhase::Subscribing | SessionPhase::Retrying,
            ..
        }
    )));
    assert_eq!(h.until_abandoned().await, AbandonReason::NoMatchingCharacteristics);
    assert_eq!(session.join().await, AbandonReason::NoMatchingCharacteristics);

    assert_eq!(sensor.connect_count(), 1);
    assert_eq!(sensor.disconnect_count(), 1);
    assert!(!sensor.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_waits_for_presence_before_reconnecting() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:04"));
    let session = h.spawn(&sensor, options());
    h.until_phase(SessionPhase::Streaming).await;

    sensor.drop_link();
    let reports = h.until_phase(SessionPhase::Retrying).await;
    assert!(reports.iter().any(|r| matches!(
        r,
        SessionReport::StateChanged {
            to: SessionPhase::Disconnected,
            ..
        }
    )));
    match reports.last() {
        Some(SessionReport::StateChanged { retry_count, .. }) => assert_eq!(*retry_count, 1),
        other => panic!("unexpected report {other:?}"),
    }

    // Backoff has long elapsed, but nothing has seen the device yet
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sensor.connect_count(), 1);

    session.confirm_presence();
    let reports = h.until_phase(SessionPhase::Streaming).await;
    assert_eq!(sensor.connect_count(), 2);
    match reports.last() {
        Some(SessionReport::StateChanged { retry_count, .. }) => assert_eq!(*retry_count, 0),
        other => panic!("unexpected report {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:05"));
    sensor.set_should_fail(true);
    let session = h.spawn(&sensor, options());

    let mut retry_counts = Vec::new();
    let reason = loop {
        match h.next_report().await {
            SessionReport::StateChanged {
                to: SessionPhase::Retrying,
                retry_count,
                ..
            } => {
                retry_counts.push(retry_count);
                session.confirm_presence();
            }
            SessionReport::Abandoned { reason, .. } => break reason,
            _ => {}
        }
    };

    assert_eq!(reason, AbandonReason::RetriesExhausted);
    assert_eq!(retry_counts, vec![1, 2]);
    assert_eq!(h.adapter.connect_attempts(), 3);
    assert!(session.join().await == AbandonReason::RetriesExhausted);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_goes_straight_to_retrying() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:06"));
    sensor.set_connect_latency(Duration::from_secs(60));
    let _session = h.spawn(&sensor, options());

    let reports = h.until_phase(SessionPhase::Retrying).await;
    match &reports[..] {
        [
            SessionReport::StateChanged {
                to: SessionPhase::Connecting,
                ..
            },
            SessionReport::StateChanged {
                from: SessionPhase::Connecting,
                to: SessionPhase::Retrying,
                ..
            },
        ] => {}
        other => panic!("unexpected reports {other:?}"),
    }
    assert_eq!(sensor.connect_count(), 0);
}

#[tokio::test]
async fn test_partial_subscribe_failure_is_excluded() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:07"));
    sensor.fail_characteristic(uuids::TEMPERATURE);
    let _session = h.spawn(&sensor, options());

    let reports = h.until_phase(SessionPhase::Streaming).await;
    assert!(reports.iter().any(|r| matches!(
        r,
        SessionReport::CharacteristicFailed { characteristic, .. } if *characteristic == uuids::TEMPERATURE
    )));
    assert_eq!(h.next_reading().await.metric, "humidity");
}

#[tokio::test]
async fn test_all_characteristics_failing_is_link_loss() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:08"));
    sensor.fail_characteristic(uuids::TEMPERATURE);
    sensor.fail_characteristic(uuids::HUMIDITY);
    let _session = h.spawn(&sensor, options());

    let reports = h.until_phase(SessionPhase::Disconnected).await;
    assert!(!reports.iter().any(|r| matches!(
        r,
        SessionReport::StateChanged {
            to: SessionPhase::Streaming,
            ..
        }
    )));
    assert!(!sensor.is_connected());
}

#[tokio::test]
async fn test_shutdown_releases_link() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:09"));
    let session = h.spawn(&sensor, options());
    h.until_phase(SessionPhase::Streaming).await;

    h.root.cancel();
    assert_eq!(session.join().await, AbandonReason::Shutdown);
    assert!(!sensor.is_connected());
    assert_eq!(sensor.disconnect_count(), 1);
}

#[tokio::test]
async fn test_disconnect_command_removes_session() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:0A"));
    let session = h.spawn(&sensor, options());
    h.until_phase(SessionPhase::Streaming).await;

    session.disconnect();
    assert_eq!(h.until_abandoned().await, AbandonReason::Removed);
    assert!(!sensor.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connects_are_serialized() {
    let mut h = Harness::new();
    let mut sessions = Vec::new();
    for i in 0..3 {
        let sensor = h.add(ess_sensor(&format!("BB:00:00:00:00:0{i}")));
        sensor.set_connect_latency(Duration::from_millis(500));
        sessions.push(h.spawn(&sensor, options()));
    }

    let mut streaming = 0;
    while streaming < 3 {
        if let SessionReport::StateChanged {
            to: SessionPhase::Streaming,
            ..
        } = h.next_report().await
        {
            streaming += 1;
        }
    }

    assert_eq!(h.adapter.connect_attempts(), 3);
    assert_eq!(h.adapter.max_concurrent_connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_polled_characteristic_is_read_on_interval() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:0B"));
    let _session = h.spawn(&sensor, options().poll_interval(Duration::from_secs(60)));
    h.until_phase(SessionPhase::Streaming).await;
    assert_eq!(h.next_reading().await.metric, "humidity");

    sensor.set_value(uuids::HUMIDITY, 5000u16.to_le_bytes());
    let reading = h.next_reading().await;
    assert!((reading.value - 50.0).abs() < 1e-9);
    assert!(sensor.read_count() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_slow_poll_read() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:0C"));
    let session = h.spawn(
        &sensor,
        options()
            .poll_interval(Duration::from_secs(60))
            .discovery_timeout(Duration::from_secs(600)),
    );
    h.until_phase(SessionPhase::Streaming).await;
    assert_eq!(h.next_reading().await.metric, "humidity");

    // The next poll read hangs well past the shutdown below.
    sensor.set_read_latency(Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(sensor.read_count(), 1);

    h.root.cancel();
    let reason = timeout(Duration::from_secs(1), session.join())
        .await
        .expect("session kept waiting on the read");
    assert_eq!(reason, AbandonReason::Shutdown);
    assert!(!sensor.is_connected());
    assert_eq!(sensor.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_poll_read_times_out_as_link_loss() {
    let mut h = Harness::new();
    let sensor = h.add(ess_sensor("AA:00:00:00:00:0D"));
    let _session = h.spawn(
        &sensor,
        options()
            .poll_interval(Duration::from_secs(60))
            .discovery_timeout(Duration::from_secs(2)),
    );
    h.until_phase(SessionPhase::Streaming).await;

    sensor.set_read_latency(Duration::from_secs(3600));
    h.until_phase(SessionPhase::Disconnected).await;
    assert!(!sensor.is_connected());
    assert_eq!(sensor.disconnect_count(), 1);
}
