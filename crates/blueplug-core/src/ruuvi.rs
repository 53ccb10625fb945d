//! RuuviTag manufacturer data decoding.
//!
//! Ruuvi sensors advertise under company id `0x0499`. The first byte of the
//! manufacturer payload selects the data format; field layout and the "not
//! available" markers are handled by [`ruuvi_sensor_protocol`], so this module
//! only maps its values onto metrics.

use ruuvi_sensor_protocol::{
    Acceleration, BatteryPotential, Humidity, MeasurementSequenceNumber, MovementCounter,
    Pressure, SensorValues, Temperature, TransmitterPower,
};

use blueplug_types::{DecodeError, Measurement, Unit, uuids};

/// Data format 3 (RAWv1).
pub const FORMAT_RAWV1: u8 = 0x03;
/// Data format 5 (RAWv2).
pub const FORMAT_RAWV2: u8 = 0x05;

const RAWV1_LEN: usize = 14;
const RAWV2_LEN: usize = 24;

/// Decode a Ruuvi manufacturer data payload (company id already stripped).
///
/// Fields the tag reports as unavailable are left out.
///
/// # Errors
///
/// Returns [`DecodeError::UnsupportedFormat`] for formats other than 3 and 5,
/// and [`DecodeError::InsufficientBytes`] for short payloads.
pub fn decode(data: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
    let expected = match data.first() {
        None => return Err(DecodeError::insufficient(1, 0)),
        Some(&FORMAT_RAWV1) => RAWV1_LEN,
        Some(&FORMAT_RAWV2) => RAWV2_LEN,
        Some(&other) => return Err(DecodeError::UnsupportedFormat(other)),
    };
    if data.len() < expected {
        return Err(DecodeError::insufficient(expected, data.len()));
    }

    let values = SensorValues::from_manufacturer_specific_data(uuids::RUUVI_MANUFACTURER_ID, data)
        .map_err(|e| DecodeError::InvalidValue(format!("Ruuvi payload: {e:?}")))?;

    let mut out = Vec::with_capacity(10);
    if let Some(millicelsius) = values.temperature_as_millicelsius() {
        out.push(Measurement::new(
            "temperature",
            f64::from(millicelsius) / 1000.0,
            Unit::Celsius,
        ));
    }
    if let Some(ppm) = values.humidity_as_ppm() {
        out.push(Measurement::new(
            "humidity",
            f64::from(ppm) / 10_000.0,
            Unit::Percent,
        ));
    }
    if let Some(pascals) = values.pressure_as_pascals() {
        out.push(Measurement::new(
            "pressure",
            f64::from(pascals) / 100.0,
            Unit::HectoPascal,
        ));
    }
    if let Some(vector) = values.acceleration_vector_as_milli_g() {
        let axes = [vector.0, vector.1, vector.2];
        for (axis, milli_g) in ["acceleration_x", "acceleration_y", "acceleration_z"]
            .into_iter()
            .zip(axes)
        {
            out.push(Measurement::new(axis, f64::from(milli_g) / 1000.0, Unit::None));
        }
    }
    if let Some(millivolts) = values.battery_potential_as_millivolts() {
        out.push(Measurement::new(
            "battery_voltage",
            f64::from(millivolts) / 1000.0,
            Unit::Volt,
        ));
    }
    if let Some(dbm) = values.tx_power_as_dbm() {
        out.push(Measurement::new("tx_power", f64::from(dbm), Unit::Dbm));
    }
    if let Some(count) = values.movement_counter() {
        out.push(Measurement::new("movement_counter", f64::from(count), Unit::None));
    }
    if let Some(sequence) = values.measurement_sequence_number() {
        out.push(Measurement::new(
            "measurement_sequence",
            f64::from(sequence),
            Unit::None,
        ));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(measurements: &[Measurement], metric: &str) -> Option<f64> {
        measurements
            .iter()
            .find(|m| m.metric == metric)
            .map(|m| m.value)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    // Reference vector from the RAWv2 format documentation.
    const RAWV2_VALID: [u8; 24] = [
        0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC,
        0x36, 0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
    ];

    #[test]
    fn test_decode_rawv2_reference_vector() {
        let m = decode(&RAWV2_VALID).unwrap();

        assert!(approx(value(&m, "temperature").unwrap(), 24.3));
        assert!(approx(value(&m, "humidity").unwrap(), 53.49));
        assert!(approx(value(&m, "pressure").unwrap(), 1000.44));
        assert!(approx(value(&m, "acceleration_x").unwrap(), 0.004));
        assert!(approx(value(&m, "acceleration_y").unwrap(), -0.004));
        assert!(approx(value(&m, "acceleration_z").unwrap(), 1.036));
        assert!(approx(value(&m, "battery_voltage").unwrap(), 2.977));
        assert!(approx(value(&m, "tx_power").unwrap(), 4.0));
        assert!(approx(value(&m, "movement_counter").unwrap(), 66.0));
        assert!(approx(value(&m, "measurement_sequence").unwrap(), 205.0));
    }

    #[test]
    fn test_decode_rawv2_omits_unavailable_fields() {
        let mut data = RAWV2_VALID;
        data[1] = 0x80;
        data[2] = 0x00;
        data[3] = 0xFF;
        data[4] = 0xFF;
        let m = decode(&data).unwrap();

        assert!(value(&m, "temperature").is_none());
        assert!(value(&m, "humidity").is_none());
        assert!(value(&m, "pressure").is_some());
    }

    #[test]
    fn test_decode_rawv1() {
        // humidity 20.5 %, temperature -1.25 °C, pressure 1000.00 hPa, battery 2.899 V
        let data = [
            0x03, 0x29, 0x81, 0x19, 0xC3, 0x50, 0xFC, 0x18, 0x03, 0xE8, 0x00, 0x00, 0x0B, 0x53,
        ];
        let m = decode(&data).unwrap();

        assert!(approx(value(&m, "humidity").unwrap(), 20.5));
        assert!(approx(value(&m, "temperature").unwrap(), -1.25));
        assert!(approx(value(&m, "pressure").unwrap(), 1000.0));
        assert!(approx(value(&m, "battery_voltage").unwrap(), 2.899));
        assert!(value(&m, "measurement_sequence").is_none());
    }

    #[test]
    fn test_decode_unsupported_format() {
        assert_eq!(
            decode(&[0x04, 0x00]),
            Err(DecodeError::UnsupportedFormat(0x04))
        );
        assert_eq!(decode(&[]), Err(DecodeError::insufficient(1, 0)));
    }

    #[test]
    fn test_decode_short_payloads() {
        assert_eq!(
            decode(&RAWV2_VALID[..10]),
            Err(DecodeError::insufficient(24, 10))
        );
        assert_eq!(
            decode(&[0x03, 0x00, 0x00]),
            Err(DecodeError::insufficient(14, 3))
        );
    }
}
