//! Well-known Bluetooth identifiers used by the built-in decoders.

use uuid::{Uuid, uuid};

/// Expand a 16-bit Bluetooth SIG assigned number into a full 128-bit UUID.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE_UUID_LOW_BITS)
}

const BASE_UUID_LOW_BITS: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

// --- Standard BLE Service UUIDs ---

/// Environmental Sensing service.
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Characteristic UUIDs ---

/// Temperature (sint16, 0.01 °C).
pub const TEMPERATURE: Uuid = uuid!("00002a6e-0000-1000-8000-00805f9b34fb");

/// Humidity (uint16, 0.01 %).
pub const HUMIDITY: Uuid = uuid!("00002a6f-0000-1000-8000-00805f9b34fb");

/// Pressure (uint32, 0.1 Pa).
pub const PRESSURE: Uuid = uuid!("00002a6d-0000-1000-8000-00805f9b34fb");

/// Battery level (uint8, percent).
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Advertisement payloads ---

/// BTHome service data UUID (0xFCD2).
pub const BTHOME_SERVICE: Uuid = uuid!("0000fcd2-0000-1000-8000-00805f9b34fb");

/// Ruuvi Innovations manufacturer id.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;
