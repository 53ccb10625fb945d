//! BTHome v2 service data decoding.
//!
//! BTHome sensors broadcast their measurements as service data under UUID
//! `0xFCD2`, so no connection is needed. Byte 0 is the device info (bit 0 =
//! encrypted, bits 5-7 = format version); object framing and scaling are
//! left to [`btsensor`].

use std::collections::HashMap;

use btsensor::Reading;

use blueplug_types::{DecodeError, Measurement, Unit, uuids};

/// Supported BTHome format version.
const BTHOME_VERSION: u8 = 2;

/// Framing metadata rather than a measurement.
const PACKET_ID: &str = "packet_id";

/// Decode a BTHome v2 service data payload.
///
/// # Errors
///
/// Returns [`DecodeError::Encrypted`] for encrypted payloads,
/// [`DecodeError::UnsupportedFormat`] for other versions and
/// [`DecodeError::InvalidValue`] when the objects cannot be framed.
pub fn decode(data: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
    let Some(&info) = data.first() else {
        return Err(DecodeError::insufficient(1, 0));
    };
    if info & 0x01 != 0 {
        return Err(DecodeError::Encrypted);
    }
    let version = info >> 5;
    if version != BTHOME_VERSION {
        return Err(DecodeError::UnsupportedFormat(version));
    }

    let service_data = HashMap::from([(uuids::BTHOME_SERVICE, data.to_vec())]);
    let v2 = match Reading::decode(&service_data) {
        Some(Reading::BtHomeV2(v2)) => v2,
        Some(_) => return Err(DecodeError::UnsupportedFormat(version)),
        None => {
            return Err(DecodeError::InvalidValue(
                "malformed BTHome object list".into(),
            ));
        }
    };

    let mut measurements = Vec::with_capacity(v2.elements.len());
    for element in &v2.elements {
        let unit = element.unit().to_string();
        let metric = metric_name(&element.name().to_string(), &unit);
        if metric == PACKET_ID {
            continue;
        }

        let value = if let Some(value) = element.value_float() {
            value as f64
        } else if let Some(value) = element.value_int() {
            value as f64
        } else if let Some(value) = element.value_bool() {
            if value { 1.0 } else { 0.0 }
        } else {
            continue;
        };

        measurements.push(Measurement::new(
            metric,
            value,
            Unit::from_symbol(&unit).unwrap_or_default(),
        ));
    }

    Ok(measurements)
}

/// Topic-safe metric name for a BTHome property.
///
/// Mass is reported in kilograms or pounds under the same property, so the
/// unit becomes part of the name.
fn metric_name(name: &str, unit: &str) -> String {
    let mut metric = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            metric.extend(c.to_lowercase());
        } else if !metric.is_empty() && !metric.ends_with('_') {
            metric.push('_');
        }
    }
    while metric.ends_with('_') {
        metric.pop();
    }

    let unit = unit.trim();
    if metric == "mass" && !unit.is_empty() {
        metric.push('_');
        metric.push_str(&unit.to_lowercase());
    }
    metric
}
