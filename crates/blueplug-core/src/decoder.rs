//! Decoder registry.
//!
//! The registry maps what a peripheral exposes to the function that turns its
//! raw bytes into [`Measurement`]s:
//!
//! - GATT characteristics, keyed by `(service, characteristic)`
//! - advertisement service data, keyed by service UUID
//! - advertisement manufacturer data, keyed by company id
//!
//! It is built once at startup and only read afterwards.

use std::collections::{HashMap, HashSet};

use bytes::Buf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blueplug_types::{DecodeError, Measurement, ReadingSource, Unit, uuids};

use crate::advertisement::Advertisement;
use crate::{bthome, ruuvi};

/// Payload format understood by a [`Decoder`].
///
/// Serialized with a `format` tag so it can sit inline in a `[[decoders]]`
/// configuration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum DecoderFormat {
    /// Environmental Sensing temperature: sint16 LE, 0.01 °C.
    EssTemperature,
    /// Environmental Sensing humidity: uint16 LE, 0.01 %.
    EssHumidity,
    /// Environmental Sensing pressure: uint32 LE, 0.1 Pa.
    EssPressure,
    /// Battery level: uint8 percent.
    BatteryLevel,
    /// BTHome v2 service data.
    Bthome,
    /// Ruuvi manufacturer data, RAWv1 (format 3) and RAWv2 (format 5).
    Ruuvi,
    /// A single number with configurable encoding.
    Scalar(ScalarFormat),
}

/// Configuration of a [`DecoderFormat::Scalar`] decoder.
///
/// `value = raw * scale + offset`, published as [`SCALAR_METRIC`] unless the
/// [`Decoder`] carries a metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarFormat {
    /// How the raw bytes are laid out.
    pub encoding: ScalarEncoding,
    /// Multiplier applied to the raw value.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Added after scaling.
    #[serde(default)]
    pub offset: f64,
    /// Unit of the decoded value.
    #[serde(default)]
    pub unit: Unit,
}

/// Metric name of a scalar value without an override.
pub const SCALAR_METRIC: &str = "value";

fn default_scale() -> f64 {
    1.0
}

/// Raw number encodings for [`ScalarFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarEncoding {
    U8,
    I8,
    U16Le,
    U16Be,
    I16Le,
    I16Be,
    U32Le,
    U32Be,
    I32Le,
    I32Be,
    F32Le,
}

impl ScalarEncoding {
    /// Number of bytes consumed.
    pub fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16Le | Self::U16Be | Self::I16Le | Self::I16Be => 2,
            Self::U32Le | Self::U32Be | Self::I32Le | Self::I32Be | Self::F32Le => 4,
        }
    }

    fn read(self, mut buf: &[u8]) -> f64 {
        match self {
            Self::U8 => f64::from(buf.get_u8()),
            Self::I8 => f64::from(buf.get_i8()),
            Self::U16Le => f64::from(buf.get_u16_le()),
            Self::U16Be => f64::from(buf.get_u16()),
            Self::I16Le => f64::from(buf.get_i16_le()),
            Self::I16Be => f64::from(buf.get_i16()),
            Self::U32Le => f64::from(buf.get_u32_le()),
            Self::U32Be => f64::from(buf.get_u32()),
            Self::I32Le => f64::from(buf.get_i32_le()),
            Self::I32Be => f64::from(buf.get_i32()),
            Self::F32Le => f64::from(buf.get_f32_le()),
        }
    }
}

impl DecoderFormat {
    /// Whether one payload can carry several metrics.
    pub fn is_multi_value(&self) -> bool {
        matches!(self, Self::Bthome | Self::Ruuvi)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
        match self {
            Self::EssTemperature => {
                let raw = read_exact::<2>(data)?;
                let value = i16::from_le_bytes(raw);
                if value == i16::MIN {
                    return Err(DecodeError::InvalidValue(
                        "temperature not available".into(),
                    ));
                }
                Ok(vec![Measurement::new(
                    "temperature",
                    f64::from(value) * 0.01,
                    Unit::Celsius,
                )])
            }
            Self::EssHumidity => {
                let value = u16::from_le_bytes(read_exact::<2>(data)?);
                if value == u16::MAX {
                    return Err(DecodeError::InvalidValue("humidity not available".into()));
                }
                Ok(vec![Measurement::new(
                    "humidity",
                    f64::from(value) * 0.01,
                    Unit::Percent,
                )])
            }
            Self::EssPressure => {
                let value = u32::from_le_bytes(read_exact::<4>(data)?);
                // 0.1 Pa resolution, published in hPa
                Ok(vec![Measurement::new(
                    "pressure",
                    f64::from(value) * 0.001,
                    Unit::HectoPascal,
                )])
            }
            Self::BatteryLevel => {
                let [value] = read_exact::<1>(data)?;
                if value > 100 {
                    return Err(DecodeError::InvalidValue(format!(
                        "battery level {value} exceeds 100"
                    )));
                }
                Ok(vec![Measurement::new(
                    "battery",
                    f64::from(value),
                    Unit::Percent,
                )])
            }
            Self::Bthome => bthome::decode(data),
            Self::Ruuvi => ruuvi::decode(data),
            Self::Scalar(format) => {
                let width = format.encoding.width();
                if data.len() < width {
                    return Err(DecodeError::insufficient(width, data.len()));
                }
                let raw = format.encoding.read(data);
                let value = raw * format.scale + format.offset;
                if !value.is_finite() {
                    return Err(DecodeError::InvalidValue(format!(
                        "scalar {value} is not a finite number"
                    )));
                }
                Ok(vec![Measurement::new(SCALAR_METRIC, value, format.unit)])
            }
        }
    }
}

/// Copy the leading `N` bytes, failing if the payload is shorter.
fn read_exact<const N: usize>(data: &[u8]) -> Result<[u8; N], DecodeError> {
    data.get(..N)
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(DecodeError::insufficient(N, data.len()))
}

/// A payload format plus an optional metric name override.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoder {
    format: DecoderFormat,
    metric: Option<String>,
}

impl Decoder {
    /// Create a decoder for a format.
    pub fn new(format: DecoderFormat) -> Self {
        Self {
            format,
            metric: None,
        }
    }

    /// Override the metric name.
    ///
    /// Single-value formats publish under the override. Multi-value formats
    /// use it as a prefix, so a Ruuvi decoder named `garage` yields
    /// `garage_temperature`.
    #[must_use]
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    /// The payload format.
    pub fn format(&self) -> &DecoderFormat {
        &self.format
    }

    /// Decode a raw payload.
    ///
    /// This is a pure function of its input.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
        let mut measurements = self.format.decode(data)?;
        if let Some(name) = &self.metric {
            let multi = self.format.is_multi_value();
            for m in &mut measurements {
                m.metric = if multi {
                    format!("{name}_{}", m.metric)
                } else {
                    name.clone()
                };
            }
        }
        Ok(measurements)
    }
}

/// Result of decoding one advertisement payload.
pub type AdvertisementDecode = (ReadingSource, Result<Vec<Measurement>, DecodeError>);

/// Read-only mapping from identifiers to decoders.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    characteristics: HashMap<(Uuid, Uuid), Decoder>,
    services: HashSet<Uuid>,
    service_data: HashMap<Uuid, Decoder>,
    manufacturer: HashMap<u16, Decoder>,
}

impl DecoderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in decoders:
    ///
    /// - Environmental Sensing temperature, humidity and pressure
    /// - Battery level
    /// - BTHome v2 service data
    /// - Ruuvi manufacturer data
    pub fn with_builtin() -> Self {
        let ess = uuids::ENVIRONMENTAL_SENSING_SERVICE;
        Self::new()
            .register(
                ess,
                uuids::TEMPERATURE,
                Decoder::new(DecoderFormat::EssTemperature),
            )
            .register(
                ess,
                uuids::HUMIDITY,
                Decoder::new(DecoderFormat::EssHumidity),
            )
            .register(
                ess,
                uuids::PRESSURE,
                Decoder::new(DecoderFormat::EssPressure),
            )
            .register(
                uuids::BATTERY_SERVICE,
                uuids::BATTERY_LEVEL,
                Decoder::new(DecoderFormat::BatteryLevel),
            )
            .register_service_data(uuids::BTHOME_SERVICE, Decoder::new(DecoderFormat::Bthome))
            .register_manufacturer(
                uuids::RUUVI_MANUFACTURER_ID,
                Decoder::new(DecoderFormat::Ruuvi),
            )
    }

    /// Map a GATT characteristic to a decoder, replacing any previous entry.
    #[must_use]
    pub fn register(mut self, service: Uuid, characteristic: Uuid, decoder: Decoder) -> Self {
        self.characteristics
            .insert((service, characteristic), decoder);
        self.services.insert(service);
        self
    }

    /// Map advertisement service data to a decoder.
    #[must_use]
    pub fn register_service_data(mut self, uuid: Uuid, decoder: Decoder) -> Self {
        self.service_data.insert(uuid, decoder);
        self
    }

    /// Map advertisement manufacturer data to a decoder.
    #[must_use]
    pub fn register_manufacturer(mut self, company_id: u16, decoder: Decoder) -> Self {
        self.manufacturer.insert(company_id, decoder);
        self
    }

    /// Look up the decoder for a GATT characteristic.
    pub fn resolve(&self, service: Uuid, characteristic: Uuid) -> Option<&Decoder> {
        self.characteristics.get(&(service, characteristic))
    }

    /// Look up the decoder for advertisement service data.
    pub fn resolve_service_data(&self, uuid: Uuid) -> Option<&Decoder> {
        self.service_data.get(&uuid)
    }

    /// Look up the decoder for advertisement manufacturer data.
    pub fn resolve_manufacturer(&self, company_id: u16) -> Option<&Decoder> {
        self.manufacturer.get(&company_id)
    }

    /// Cheap check whether connecting to the advertiser could yield readings.
    ///
    /// True when the advertisement lists a service that has at least one
    /// characteristic decoder. Passive payloads do not count, they are
    /// decoded without a connection (see [`decodes_passively`](Self::decodes_passively)).
    pub fn could_apply(&self, advertisement: &Advertisement) -> bool {
        advertisement
            .services
            .iter()
            .any(|uuid| self.services.contains(uuid))
    }

    /// Whether the advertisement carries a payload with a registered decoder.
    pub fn decodes_passively(&self, advertisement: &Advertisement) -> bool {
        advertisement
            .service_data
            .keys()
            .any(|uuid| self.service_data.contains_key(uuid))
            || advertisement
                .manufacturer_data
                .keys()
                .any(|id| self.manufacturer.contains_key(id))
    }

    /// Decode every recognized payload of an advertisement.
    pub fn decode_advertisement(&self, advertisement: &Advertisement) -> Vec<AdvertisementDecode> {
        let service_data = advertisement
            .service_data
            .iter()
            .filter_map(|(uuid, data)| {
                self.resolve_service_data(*uuid).map(|decoder| {
                    (
                        ReadingSource::ServiceData { uuid: *uuid },
                        decoder.decode(data),
                    )
                })
            });
        let manufacturer = advertisement
            .manufacturer_data
            .iter()
            .filter_map(|(company_id, data)| {
                self.resolve_manufacturer(*company_id).map(|decoder| {
                    (
                        ReadingSource::ManufacturerData {
                            company_id: *company_id,
                        },
                        decoder.decode(data),
                    )
                })
            });
        service_data.chain(manufacturer).collect()
    }

    /// Number of GATT characteristic mappings.
    pub fn characteristic_count(&self) -> usize {
        self.characteristics.len()
    }

    /// Number of registered decoders of any kind.
    pub fn len(&self) -> usize {
        self.characteristics.len() + self.service_data.len() + self.manufacturer.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
