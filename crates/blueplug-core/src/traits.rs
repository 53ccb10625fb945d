//! Trait abstractions over the host radio.
//!
//! [`BleAdapter`] and [`BleLink`] are the seam between the bridge and the
//! platform Bluetooth stack. The production implementation wraps btleplug
//! ([`crate::BtleplugAdapter`]); tests use [`crate::mock::MockAdapter`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::Stream;
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::advertisement::Advertisement;
use crate::error::Result;

/// Stream of raw advertisements from an active scan.
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Stream of characteristic notifications from a connected peripheral.
///
/// The stream ends when the link goes away.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Properties of a GATT characteristic that matter to the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    /// Value can be read.
    pub read: bool,
    /// Value can be written.
    pub write: bool,
    /// Value changes are notified.
    pub notify: bool,
    /// Value changes are indicated.
    pub indicate: bool,
}

impl CharProps {
    /// Readable only.
    pub const READ: Self = Self {
        read: true,
        write: false,
        notify: false,
        indicate: false,
    };

    /// Notify only.
    pub const NOTIFY: Self = Self {
        read: false,
        write: false,
        notify: true,
        indicate: false,
    };

    /// Readable and notifying.
    pub const READ_NOTIFY: Self = Self {
        read: true,
        write: false,
        notify: true,
        indicate: false,
    };

    /// Whether the characteristic can push values to us.
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// UUID of the owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub props: CharProps,
}

/// A primary service reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create a service with the given characteristics.
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = (Uuid, CharProps)>) -> Self {
        Self {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(|(char_uuid, props)| GattCharacteristic {
                    service: uuid,
                    uuid: char_uuid,
                    props,
                })
                .collect(),
        }
    }
}

/// A value pushed by a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that changed.
    pub characteristic: Uuid,
    /// New value.
    pub value: Vec<u8>,
}

/// The host radio adapter.
///
/// One adapter is shared by the scanner and every session. Implementations
/// must be safe to call concurrently; connect serialization is done by the
/// caller.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Start scanning and return the stream of advertisements.
    ///
    /// `services` is passed to the platform as a scan filter; an empty slice
    /// scans for everything. Fails with `AdapterUnavailable` if the radio
    /// cannot scan.
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link to a peripheral.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn BleLink>>;
}

/// A connected peripheral.
///
/// Dropping a link without calling [`disconnect`](Self::disconnect) leaves
/// cleanup to the implementation; sessions always disconnect explicitly.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Identity of the peripheral.
    fn identity(&self) -> &DeviceIdentity;

    /// Check if the link is still up.
    async fn is_connected(&self) -> bool;

    /// Enumerate services and characteristics.
    async fn discover(&self) -> Result<Vec<GattService>>;

    /// Read a characteristic value.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value (with response).
    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications or indications on a characteristic.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Stream of notifications for every subscribed characteristic.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;
}
