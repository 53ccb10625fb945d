//! btleplug implementation of [`BleAdapter`].

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blueplug_types::DeviceIdentity;

use crate::advertisement::Advertisement;
use crate::device::BtleplugLink;
use crate::error::{Error, Result};
use crate::traits::{AdvertisementStream, BleAdapter, BleLink};
use crate::util::create_identifier;

/// Get the first available Bluetooth adapter.
///
/// Any failure to reach the platform Bluetooth stack is reported as
/// [`Error::AdapterUnavailable`].
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(adapter_error)?;
    let adapters = manager.adapters().await.map_err(adapter_error)?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::adapter_unavailable("no Bluetooth adapter available"))
}

fn adapter_error(e: btleplug::Error) -> Error {
    Error::adapter_unavailable(e.to_string())
}

/// The host radio, backed by btleplug.
#[derive(Debug, Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Use the first adapter on the host.
    pub async fn first() -> Result<Self> {
        let adapter = get_adapter().await?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }
        Ok(Self { adapter })
    }

    /// Wrap an adapter obtained elsewhere.
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Search through known peripherals for one with the given identity.
    async fn find_peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await
                && create_identifier(&props.address.to_string(), &peripheral.id()) == *identity
            {
                debug!("Matched peripheral for {}", identity);
                return Ok(peripheral);
            }
        }

        Err(Error::DeviceNotFound(identity.to_string()))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await.map_err(adapter_error)?;
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(adapter_error)?;
        info!("Scanning started ({} service filter(s))", services.len());

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move { advertisement_from_event(&adapter, event).await }
        });

        Ok(Box::pin(stream))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        info!("Scanning stopped");
        Ok(())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn BleLink>> {
        let peripheral = self.find_peripheral(identity).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        Ok(Box::new(BtleplugLink::new(identity.clone(), peripheral)))
    }
}

/// Turn a central event into an advertisement snapshot.
///
/// The peripheral's cached properties supply identity, name and signal
/// strength; payload-carrying events override the cached payload with the
/// fresh one.
async fn advertisement_from_event(adapter: &Adapter, event: CentralEvent) -> Option<Advertisement> {
    let (id, fresh) = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => (id, None),
        CentralEvent::ManufacturerDataAdvertisement {
            id,
            manufacturer_data,
        } => (id, Some(Payload::Manufacturer(manufacturer_data))),
        CentralEvent::ServiceDataAdvertisement { id, service_data } => {
            (id, Some(Payload::ServiceData(service_data)))
        }
        CentralEvent::ServicesAdvertisement { id, services } => {
            (id, Some(Payload::Services(services)))
        }
        _ => return None,
    };

    let mut advertisement = snapshot(adapter, &id).await?;
    match fresh {
        Some(Payload::Manufacturer(data)) => advertisement.manufacturer_data.extend(data),
        Some(Payload::ServiceData(data)) => advertisement.service_data.extend(data),
        Some(Payload::Services(services)) => {
            for uuid in services {
                advertisement = advertisement.with_service(uuid);
            }
        }
        None => {}
    }
    Some(advertisement)
}

enum Payload {
    Manufacturer(std::collections::HashMap<u16, Vec<u8>>),
    ServiceData(std::collections::HashMap<Uuid, Vec<u8>>),
    Services(Vec<Uuid>),
}

async fn snapshot(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            debug!("Event for unknown peripheral: {}", e);
            return None;
        }
    };
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read peripheral properties: {}", e);
            return None;
        }
    };

    let mut advertisement =
        Advertisement::new(create_identifier(&props.address.to_string(), &peripheral.id()));
    advertisement.name = props.local_name;
    advertisement.rssi = props.rssi;
    advertisement.services = props.services;
    advertisement.service_data = props.service_data;
    advertisement.manufacturer_data = props.manufacturer_data;
    Some(advertisement)
}
