//! btleplug implementation of [`BleLink`].

use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::error::{Error, Result};
use crate::traits::{BleLink, CharProps, GattService, Notification, NotificationStream};

/// A connected btleplug peripheral.
pub struct BtleplugLink {
    identity: DeviceIdentity,
    peripheral: Peripheral,
    /// Characteristics by (service, characteristic), filled by `discover`.
    characteristics: RwLock<HashMap<(Uuid, Uuid), Characteristic>>,
}

impl std::fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("identity", &self.identity)
            .finish()
    }
}

impl BtleplugLink {
    pub(crate) fn new(identity: DeviceIdentity, peripheral: Peripheral) -> Self {
        Self {
            identity,
            peripheral,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    async fn find_characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .await
            .get(&(service, uuid))
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(service, uuid))
    }
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE)
            || flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        let services = self.peripheral.services();
        debug!("Found {} services on {}", services.len(), self.identity);

        let mut cache = HashMap::new();
        let mut discovered = Vec::with_capacity(services.len());
        for service in &services {
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| {
                    cache.insert((service.uuid, c.uuid), c.clone());
                    (c.uuid, char_props(c.properties))
                })
                .collect::<Vec<_>>();
            discovered.push(GattService::new(service.uuid, characteristics));
        }
        *self.characteristics.write().await = cache;

        Ok(discovered)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.find_characteristic(service, characteristic).await?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let c = self.find_characteristic(service, characteristic).await?;
        self.peripheral
            .write(&c, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let c = self.find_characteristic(service, characteristic).await?;
        self.peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.map(|n| Notification {
            characteristic: n.uuid,
            value: n.value,
        })))
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.identity, e);
            return Err(e.into());
        }
        debug!("Disconnected from {}", self.identity);
        Ok(())
    }
}
