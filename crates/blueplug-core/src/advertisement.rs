//! Advertisement packets observed while scanning.

use std::collections::HashMap;

use blueplug_types::DeviceIdentity;
use tokio::time::Instant;
use uuid::Uuid;

/// One advertisement as seen by the scanner.
///
/// Advertisements are ephemeral: they are produced per scan event, routed by
/// the coordinator and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Identity of the advertising peripheral.
    pub identity: DeviceIdentity,
    /// Local name, if the peripheral advertises one.
    pub name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Service data, keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Manufacturer-specific data, keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// When the packet was received.
    pub received_at: Instant,
}

impl Advertisement {
    /// Create an empty advertisement for an identity, received now.
    pub fn new(identity: impl Into<DeviceIdentity>) -> Self {
        Self {
            identity: identity.into(),
            name: None,
            rssi: None,
            services: Vec::new(),
            service_data: HashMap::new(),
            manufacturer_data: HashMap::new(),
            received_at: Instant::now(),
        }
    }

    /// Set the local name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Add an advertised service UUID.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
        self
    }

    /// Add service data.
    #[must_use]
    pub fn with_service_data(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.service_data.insert(uuid, data.into());
        self
    }

    /// Add manufacturer data.
    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(company_id, data.into());
        self
    }

    /// Set the receive instant.
    #[must_use]
    pub fn received_at(mut self, at: Instant) -> Self {
        self.received_at = at;
        self
    }

    /// Whether the peripheral advertises `uuid`, either as a service or as service data.
    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid) || self.service_data.contains_key(uuid)
    }

    /// Fold a newer advertisement from the same identity into this one.
    ///
    /// Signal strength, name and receive time follow the newer packet; service
    /// lists are united and payload maps keep the newest value per key.
    pub fn merge(&mut self, newer: Advertisement) {
        debug_assert_eq!(self.identity, newer.identity);

        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        if newer.name.is_some() {
            self.name = newer.name;
        }
        for uuid in newer.services {
            if !self.services.contains(&uuid) {
                self.services.push(uuid);
            }
        }
        self.service_data.extend(newer.service_data);
        self.manufacturer_data.extend(newer.manufacturer_data);
        self.received_at = self.received_at.max(newer.received_at);
    }
}
