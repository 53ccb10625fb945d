//! Mock radio backend for testing.
//!
//! [`MockAdapter`] and [`MockPeripheral`] implement the [`BleAdapter`] and
//! [`BleLink`] traits without any Bluetooth hardware.
//!
//! # Features
//!
//! - **Advertisement injection**: push advertisements into the active scan
//! - **Notification injection**: push values on subscribed characteristics
//! - **Failure injection**: fail connects, or reads/subscribes on chosen characteristics
//! - **Latency simulation**: delay connects to exercise timeouts
//! - **Link loss**: drop a connected link at any point

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::advertisement::Advertisement;
use crate::error::{Error, Result};
use crate::traits::{
    AdvertisementStream, BleAdapter, BleLink, CharProps, GattService, Notification,
    NotificationStream,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>> {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// A mock radio adapter.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use blueplug_core::mock::{MockAdapter, MockPeripheral};
/// use blueplug_core::{BleAdapter, BleLink, CharProps};
/// use blueplug_types::uuids;
///
/// #[tokio::main]
/// async fn main() {
///     let adapter = MockAdapter::new();
///     let sensor = Arc::new(MockPeripheral::new("AA:BB:CC:DD:EE:FF").with_service(
///         uuids::ENVIRONMENTAL_SENSING_SERVICE,
///         [(uuids::TEMPERATURE, CharProps::READ_NOTIFY)],
///     ));
///     adapter.add_peripheral(sensor.clone());
///
///     let link = adapter.connect(sensor.identity()).await.unwrap();
///     assert_eq!(link.discover().await.unwrap().len(), 1);
/// }
/// ```
#[derive(Default)]
pub struct MockAdapter {
    peripherals: Mutex<HashMap<DeviceIdentity, Arc<MockPeripheral>>>,
    scan_tx: Mutex<Option<mpsc::UnboundedSender<Advertisement>>>,
    unavailable: AtomicBool,
    scan_starts: AtomicU32,
    connect_attempts: AtomicU32,
    active_connects: AtomicU32,
    max_concurrent_connects: AtomicU32,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("peripherals", &lock(&self.peripherals).len())
            .field("scanning", &lock(&self.scan_tx).is_some())
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockAdapter {
    /// Create an adapter with no peripherals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a peripheral connectable.
    pub fn add_peripheral(&self, peripheral: Arc<MockPeripheral>) {
        lock(&self.peripherals).insert(peripheral.identity().clone(), peripheral);
    }

    /// Push an advertisement into the active scan.
    ///
    /// Returns `false` if no scan is running.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        lock(&self.scan_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(advertisement).is_ok())
    }

    /// End the active advertisement stream, as a radio reset would.
    pub fn end_scan(&self) {
        lock(&self.scan_tx).take();
    }

    /// Make scanning fail with `AdapterUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        lock(&self.scan_tx).is_some()
    }

    /// Number of successful scan starts.
    pub fn scan_starts(&self) -> u32 {
        self.scan_starts.load(Ordering::Relaxed)
    }

    /// Number of connect calls.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Highest number of connects observed in flight at once.
    pub fn max_concurrent_connects(&self) -> u32 {
        self.max_concurrent_connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn start_scan(&self, _services: &[Uuid]) -> Result<AdvertisementStream> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::adapter_unavailable("mock adapter unavailable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.scan_tx) = Some(tx);
        self.scan_starts.fetch_add(1, Ordering::Relaxed);
        Ok(receiver_stream(rx))
    }

    async fn stop_scan(&self) -> Result<()> {
        lock(&self.scan_tx).take();
        Ok(())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn BleLink>> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.active_connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_connects
            .fetch_max(in_flight, Ordering::SeqCst);
        // Decrements even if the connect future is dropped by a timeout
        let _in_flight = InFlight(&self.active_connects);

        let peripheral = lock(&self.peripherals).get(identity).cloned();
        let result = match peripheral {
            Some(peripheral) => peripheral.accept_connection().await.map(|()| {
                Box::new(MockLink {
                    identity: identity.clone(),
                    peripheral,
                }) as Box<dyn BleLink>
            }),
            None => Err(Error::DeviceNotFound(identity.to_string())),
        };

        result
    }
}

struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A mock peripheral with a GATT table.
pub struct MockPeripheral {
    identity: DeviceIdentity,
    services: Mutex<Vec<GattService>>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing: Mutex<HashSet<Uuid>>,
    subscriptions: Mutex<HashSet<Uuid>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    connected: AtomicBool,
    should_fail: AtomicBool,
    /// Number of connects to fail before succeeding.
    remaining_failures: AtomicU32,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    read_latency_ms: AtomicU64,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    read_count: AtomicU32,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("identity", &self.identity)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockPeripheral {
    /// Create a peripheral with an empty GATT table.
    pub fn new(identity: impl Into<DeviceIdentity>) -> Self {
        Self {
            identity: identity.into(),
            services: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            should_fail: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            connect_latency_ms: AtomicU64::new(0),
            read_latency_ms: AtomicU64::new(0),
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
        }
    }

    /// Add a service with its characteristics.
    #[must_use]
    pub fn with_service(
        self,
        service: Uuid,
        characteristics: impl IntoIterator<Item = (Uuid, CharProps)>,
    ) -> Self {
        lock(&self.services).push(GattService::new(service, characteristics));
        self
    }

    /// Set the value returned by reads of a characteristic.
    #[must_use]
    pub fn with_value(self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.set_value(characteristic, value);
        self
    }

    /// Identity of the peripheral.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Change the value returned by reads.
    pub fn set_value(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) {
        lock(&self.values).insert(characteristic, value.into());
    }

    /// Make every connect fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `count` connects, then succeed.
    pub fn fail_next_connects(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Make reads and subscribes of a characteristic fail.
    pub fn fail_characteristic(&self, characteristic: Uuid) {
        lock(&self.failing).insert(characteristic);
    }

    /// Delay connects by the given duration.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Delay every characteristic read by the given duration.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Push a notification on a subscribed characteristic.
    ///
    /// Returns `false` if the link is down or the characteristic is not
    /// subscribed.
    pub fn notify(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> bool {
        if !self.is_connected() || !lock(&self.subscriptions).contains(&characteristic) {
            return false;
        }
        lock(&self.notify_tx).as_ref().is_some_and(|tx| {
            tx.send(Notification {
                characteristic,
                value: value.into(),
            })
            .is_ok()
        })
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::Relaxed);
        lock(&self.notify_tx).take();
        lock(&self.subscriptions).clear();
    }

    /// Whether a link is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Whether a characteristic is subscribed.
    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        lock(&self.subscriptions).contains(&characteristic)
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Explicit disconnects so far.
    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }

    /// Successful reads so far.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Values written so far.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    async fn accept_connection(&self) -> Result<()> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Bluetooth(btleplug::Error::NotConnected));
        }
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Bluetooth(btleplug::Error::NotConnected));
        }

        self.connected.store(true, Ordering::Relaxed);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::link_lost(&self.identity))
        }
    }

    fn ensure_not_failing(&self, characteristic: Uuid) -> Result<()> {
        if lock(&self.failing).contains(&characteristic) {
            Err(Error::Bluetooth(btleplug::Error::NotSupported(format!(
                "mock failure on {characteristic}"
            ))))
        } else {
            Ok(())
        }
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        lock(&self.services).iter().any(|s| {
            s.uuid == service && s.characteristics.iter().any(|c| c.uuid == characteristic)
        })
    }
}

/// A link to a [`MockPeripheral`].
struct MockLink {
    identity: DeviceIdentity,
    peripheral: Arc<MockPeripheral>,
}

#[async_trait]
impl BleLink for MockLink {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected()
    }

    async fn discover(&self) -> Result<Vec<GattService>> {
        self.peripheral.ensure_connected()?;
        Ok(lock(&self.peripheral.services).clone())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let latency = self.peripheral.read_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.peripheral.ensure_connected()?;
        self.peripheral.ensure_not_failing(characteristic)?;
        if !self.peripheral.has_characteristic(service, characteristic) {
            return Err(Error::characteristic_not_found(service, characteristic));
        }
        let value = lock(&self.peripheral.values)
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        self.peripheral.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.peripheral.ensure_connected()?;
        if !self.peripheral.has_characteristic(service, characteristic) {
            return Err(Error::characteristic_not_found(service, characteristic));
        }
        lock(&self.peripheral.writes).push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        self.peripheral.ensure_connected()?;
        self.peripheral.ensure_not_failing(characteristic)?;
        if !self.peripheral.has_characteristic(service, characteristic) {
            return Err(Error::characteristic_not_found(service, characteristic));
        }
        lock(&self.peripheral.subscriptions).insert(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        self.peripheral.ensure_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.peripheral.notify_tx) = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected() {
            self.peripheral
                .disconnect_count
                .fetch_add(1, Ordering::Relaxed);
        }
        self.peripheral.drop_link();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueplug_types::uuids;
    use futures::StreamExt;

    fn sensor() -> Arc<MockPeripheral> {
        Arc::new(
            MockPeripheral::new("AA:BB:CC:DD:EE:FF")
                .with_service(
                    uuids::ENVIRONMENTAL_SENSING_SERVICE,
                    [(uuids::TEMPERATURE, CharProps::READ_NOTIFY)],
                )
                .with_value(uuids::TEMPERATURE, vec![0x0A, 0x09]),
        )
    }

    #[tokio::test]
    async fn test_connect_read_and_notify() {
        let adapter = MockAdapter::new();
        let peripheral = sensor();
        adapter.add_peripheral(peripheral.clone());

        let link = adapter.connect(peripheral.identity()).await.unwrap();
        assert!(link.is_connected().await);

        let value = link
            .read(uuids::ENVIRONMENTAL_SENSING_SERVICE, uuids::TEMPERATURE)
            .await
            .unwrap();
        assert_eq!(value, vec![0x0A, 0x09]);

        link.subscribe(uuids::ENVIRONMENTAL_SENSING_SERVICE, uuids::TEMPERATURE)
            .await
            .unwrap();
        let mut notifications = link.notifications().await.unwrap();
        assert!(peripheral.notify(uuids::TEMPERATURE, vec![1, 2]));

        let n = notifications.next().await.unwrap();
        assert_eq!(n.characteristic, uuids::TEMPERATURE);
        assert_eq!(n.value, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_link_ends_notifications() {
        let adapter = MockAdapter::new();
        let peripheral = sensor();
        adapter.add_peripheral(peripheral.clone());

        let link = adapter.connect(peripheral.identity()).await.unwrap();
        let mut notifications = link.notifications().await.unwrap();
        peripheral.drop_link();

        assert!(notifications.next().await.is_none());
        assert!(!link.is_connected().await);
        assert!(link.discover().await.unwrap_err().is_link_failure());
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let adapter = MockAdapter::new();
        let peripheral = sensor();
        adapter.add_peripheral(peripheral.clone());

        peripheral.fail_next_connects(2);
        assert!(adapter.connect(peripheral.identity()).await.is_err());
        assert!(adapter.connect(peripheral.identity()).await.is_err());
        assert!(adapter.connect(peripheral.identity()).await.is_ok());
        assert_eq!(adapter.connect_attempts(), 3);
        assert_eq!(peripheral.connect_count(), 1);

        let unknown = DeviceIdentity::new("00:00:00:00:00:01");
        assert!(matches!(
            adapter.connect(&unknown).await.err().unwrap(),
            Error::DeviceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_failing_characteristic() {
        let adapter = MockAdapter::new();
        let peripheral = sensor();
        peripheral.fail_characteristic(uuids::TEMPERATURE);
        adapter.add_peripheral(peripheral.clone());

        let link = adapter.connect(peripheral.identity()).await.unwrap();
        assert!(
            link.subscribe(uuids::ENVIRONMENTAL_SENSING_SERVICE, uuids::TEMPERATURE)
                .await
                .is_err()
        );
        assert!(!peripheral.is_subscribed(uuids::TEMPERATURE));
    }

    #[tokio::test]
    async fn test_scan_injection() {
        let adapter = MockAdapter::new();
        assert!(!adapter.advertise(Advertisement::new("AA")));

        let mut stream = adapter.start_scan(&[]).await.unwrap();
        assert!(adapter.advertise(Advertisement::new("AA").with_rssi(-42)));
        assert_eq!(stream.next().await.unwrap().rssi, Some(-42));

        adapter.stop_scan().await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
