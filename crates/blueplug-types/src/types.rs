//! Core types for bridged sensor data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Stable identity of a BLE peripheral.
///
/// On Linux and Windows this is the Bluetooth address; on macOS, where
/// addresses are hidden, it is the platform peripheral id. The value is
/// normalized to upper case so that `aa:bb:..` and `AA:BB:..` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Create an identity from an address or platform id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_uppercase())
    }

    /// The normalized identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceIdentity {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unit of a decoded value.
///
/// Serialized as the unit symbol, which is also what ends up in MQTT payloads.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new units
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Unit {
    /// Degrees Celsius.
    #[cfg_attr(feature = "serde", serde(rename = "°C", alias = "celsius"))]
    Celsius,
    /// Percent (relative humidity, battery, moisture).
    #[cfg_attr(feature = "serde", serde(rename = "%", alias = "percent"))]
    Percent,
    /// Hectopascal.
    #[cfg_attr(feature = "serde", serde(rename = "hPa", alias = "hectopascal"))]
    HectoPascal,
    /// Volt.
    #[cfg_attr(feature = "serde", serde(rename = "V", alias = "volt"))]
    Volt,
    /// Lux.
    #[cfg_attr(feature = "serde", serde(rename = "lx", alias = "lux"))]
    Lux,
    /// Parts per million.
    #[cfg_attr(feature = "serde", serde(rename = "ppm"))]
    PartsPerMillion,
    /// Micrograms per cubic meter.
    #[cfg_attr(feature = "serde", serde(rename = "µg/m³", alias = "ugm3"))]
    MicrogramsPerCubicMeter,
    /// Watt.
    #[cfg_attr(feature = "serde", serde(rename = "W", alias = "watt"))]
    Watt,
    /// Kilowatt-hour.
    #[cfg_attr(feature = "serde", serde(rename = "kWh", alias = "kilowatt_hour"))]
    KilowattHour,
    /// Decibel-milliwatts.
    #[cfg_attr(feature = "serde", serde(rename = "dBm"))]
    Dbm,
    /// Kilogram.
    #[cfg_attr(feature = "serde", serde(rename = "kg", alias = "kilogram"))]
    Kilogram,
    /// Pound.
    #[cfg_attr(feature = "serde", serde(rename = "lb", alias = "pound"))]
    Pound,
    /// Dimensionless value (counters, flags).
    #[cfg_attr(feature = "serde", serde(rename = "", alias = "none"))]
    #[default]
    None,
}

impl Unit {
    /// The unit symbol, empty for dimensionless values.
    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::HectoPascal => "hPa",
            Unit::Volt => "V",
            Unit::Lux => "lx",
            Unit::PartsPerMillion => "ppm",
            Unit::MicrogramsPerCubicMeter => "µg/m³",
            Unit::Watt => "W",
            Unit::KilowattHour => "kWh",
            Unit::Dbm => "dBm",
            Unit::Kilogram => "kg",
            Unit::Pound => "lb",
            Unit::None => "",
        }
    }

    /// Look up a unit by the symbol sensors report, accepting common ASCII
    /// spellings. Returns `None` for symbols with no matching variant.
    pub fn from_symbol(symbol: &str) -> Option<Unit> {
        let unit = match symbol.trim() {
            "°C" | "C" | "degC" => Unit::Celsius,
            "%" => Unit::Percent,
            "hPa" | "mbar" => Unit::HectoPascal,
            "V" => Unit::Volt,
            "lx" | "lux" => Unit::Lux,
            "ppm" => Unit::PartsPerMillion,
            "µg/m³" | "ug/m3" | "μg/m³" => Unit::MicrogramsPerCubicMeter,
            "W" => Unit::Watt,
            "kWh" => Unit::KilowattHour,
            "dBm" => Unit::Dbm,
            "kg" => Unit::Kilogram,
            "lb" => Unit::Pound,
            "" => Unit::None,
            _ => return None,
        };
        Some(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One decoded value, before it is attributed to a device and a point in time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurement {
    /// Metric name, used as the last MQTT topic segment (e.g. `temperature`).
    pub metric: String,
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
}

impl Measurement {
    /// Create a new measurement.
    pub fn new(metric: impl Into<String>, value: f64, unit: Unit) -> Self {
        Self {
            metric: metric.into(),
            value,
            unit,
        }
    }
}

/// Where a reading was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ReadingSource {
    /// A GATT characteristic, read or notified over a connection.
    Characteristic {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Service data carried in an advertisement.
    ServiceData {
        /// Service data UUID.
        uuid: Uuid,
    },
    /// Manufacturer-specific data carried in an advertisement.
    ManufacturerData {
        /// Bluetooth SIG company identifier.
        company_id: u16,
    },
}

/// A decoded reading from a device.
///
/// Readings are immutable once produced: they travel from the session that
/// decoded them to the publish bridge, which turns them into MQTT messages.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Device the reading came from.
    pub device: DeviceIdentity,
    /// Metric name.
    pub metric: String,
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
    /// Characteristic or advertisement field the value was decoded from.
    pub source: ReadingSource,
    /// When the raw payload was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub captured_at: OffsetDateTime,
}

impl Reading {
    /// Attribute a measurement to a device and a capture time.
    pub fn from_measurement(
        device: DeviceIdentity,
        source: ReadingSource,
        measurement: Measurement,
        captured_at: OffsetDateTime,
    ) -> Self {
        Self {
            device,
            metric: measurement.metric,
            value: measurement.value,
            unit: measurement.unit,
            source,
            captured_at,
        }
    }
}
