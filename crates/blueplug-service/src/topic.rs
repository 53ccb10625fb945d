//! Mapping from readings to MQTT topics and payloads.
//!
//! # Topic Structure
//!
//! By default every reading is published to
//!
//! - `{prefix}/{device}/{metric}`
//!
//! where `{prefix}` is configurable (default: `blueplug`), `{device}` is the
//! configured alias of the device or its sanitized identity, and `{metric}`
//! is the metric name of the reading (e.g. `temperature`).
//!
//! A decoder can override the template; the same placeholders are available.
//!
//! # Payload
//!
//! ```json
//! {"value": 21.5, "unit": "°C", "timestamp": "2024-05-01T12:00:00Z", "device": "AA:BB:CC:DD:EE:FF"}
//! ```

use std::collections::HashMap;

use rumqttc::QoS;
use serde::Serialize;
use time::OffsetDateTime;

use blueplug_types::{DeviceIdentity, Reading, ReadingSource, Unit};

use crate::queue::PublishJob;

/// Template used when no override applies.
pub const DEFAULT_TEMPLATE: &str = "{prefix}/{device}/{metric}";

#[derive(Serialize)]
struct Payload<'a> {
    value: f64,
    unit: Unit,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    device: &'a str,
}

/// Turns readings into [`PublishJob`]s.
#[derive(Debug, Clone)]
pub struct TopicMapper {
    prefix: String,
    qos: QoS,
    retain: bool,
    aliases: HashMap<DeviceIdentity, String>,
    overrides: HashMap<ReadingSource, String>,
}

impl TopicMapper {
    /// Create a mapper publishing under `prefix`.
    pub fn new(prefix: impl Into<String>, qos: QoS, retain: bool) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            qos,
            retain,
            aliases: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Publish a device under `alias` instead of its identity.
    #[must_use]
    pub fn with_alias(mut self, device: DeviceIdentity, alias: impl Into<String>) -> Self {
        self.set_alias(device, alias);
        self
    }

    /// Use `template` for readings decoded from `source`.
    #[must_use]
    pub fn with_override(mut self, source: ReadingSource, template: impl Into<String>) -> Self {
        self.overrides.insert(source, template.into());
        self
    }

    /// Register or replace an alias.
    pub fn set_alias(&mut self, device: DeviceIdentity, alias: impl Into<String>) {
        self.aliases.insert(device, alias.into());
    }

    /// Topic prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The `{device}` topic segment for a device.
    pub fn device_segment(&self, device: &DeviceIdentity) -> String {
        let name = self
            .aliases
            .get(device)
            .map(String::as_str)
            .unwrap_or_else(|| device.as_str());
        sanitize_topic_segment(name)
    }

    /// Full topic for a reading.
    pub fn topic(&self, reading: &Reading) -> String {
        let template = self
            .overrides
            .get(&reading.source)
            .map(String::as_str)
            .unwrap_or(DEFAULT_TEMPLATE);
        template
            .replace("{prefix}", &self.prefix)
            .replace("{device}", &self.device_segment(&reading.device))
            .replace("{metric}", &sanitize_topic_segment(&reading.metric))
    }

    /// JSON payload for a reading.
    pub fn payload(&self, reading: &Reading) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Payload {
            value: reading.value,
            unit: reading.unit,
            timestamp: reading.captured_at,
            device: reading.device.as_str(),
        })
    }

    /// Build the publish job for a reading.
    pub fn job(&self, reading: &Reading) -> serde_json::Result<PublishJob> {
        Ok(PublishJob {
            topic: self.topic(reading),
            payload: self.payload(reading)?,
            qos: self.qos,
            retain: self.retain,
        })
    }
}

/// Sanitize a device or metric name for use in an MQTT topic.
///
/// MQTT topics cannot contain '#' or '+' wildcards, and should avoid spaces.
/// Slashes would add topic levels.
pub fn sanitize_topic_segment(s: &str) -> String {
    s.replace(['#', '+', ' ', '/'], "_")
}

/// Convert a numeric QoS level to the client type. Levels above 2 map to 2.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueplug_types::{Measurement, uuids};
    use proptest::prelude::*;

    fn reading(device: &str, metric: &str, value: f64, unit: Unit) -> Reading {
        Reading::from_measurement(
            DeviceIdentity::new(device),
            ReadingSource::Characteristic {
                service: uuids::ENVIRONMENTAL_SENSING_SERVICE,
                characteristic: uuids::TEMPERATURE,
            },
            Measurement::new(metric, value, unit),
            OffsetDateTime::from_unix_timestamp(1_714_564_800).unwrap(),
        )
    }

    #[test]
    fn test_default_topic() {
        let mapper = TopicMapper::new("home/ble/", QoS::AtLeastOnce, false);
        let r = reading("aa:bb:cc:dd:ee:ff", "temperature", 21.5, Unit::Celsius);
        assert_eq!(mapper.topic(&r), "home/ble/AA:BB:CC:DD:EE:FF/temperature");
    }

    #[test]
    fn test_alias_replaces_identity() {
        let mapper = TopicMapper::new("blueplug", QoS::AtLeastOnce, false)
            .with_alias(DeviceIdentity::new("AA:BB:CC:DD:EE:FF"), "Living Room");
        let r = reading("aa:bb:cc:dd:ee:ff", "humidity", 40.0, Unit::Percent);
        assert_eq!(mapper.topic(&r), "blueplug/Living_Room/humidity");
    }

    #[test]
    fn test_override_template() {
        let source = ReadingSource::Characteristic {
            service: uuids::ENVIRONMENTAL_SENSING_SERVICE,
            characteristic: uuids::TEMPERATURE,
        };
        let mapper = TopicMapper::new("blueplug", QoS::AtMostOnce, true)
            .with_override(source, "climate/{device}/{metric}/state");
        let r = reading("AA:BB:CC:DD:EE:FF", "temperature", 20.0, Unit::Celsius);
        assert_eq!(mapper.topic(&r), "climate/AA:BB:CC:DD:EE:FF/temperature/state");

        let other = Reading {
            source: ReadingSource::ManufacturerData { company_id: 0x0499 },
            ..r
        };
        assert_eq!(mapper.topic(&other), "blueplug/AA:BB:CC:DD:EE:FF/temperature");
    }

    #[test]
    fn test_payload_fields() {
        let mapper = TopicMapper::new("blueplug", QoS::AtLeastOnce, false);
        let r = reading("AA:BB:CC:DD:EE:FF", "temperature", 21.5, Unit::Celsius);
        let payload: serde_json::Value = serde_json::from_slice(&mapper.payload(&r).unwrap()).unwrap();

        assert_eq!(payload["value"], 21.5);
        assert_eq!(payload["unit"], "°C");
        assert_eq!(payload["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(payload["device"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_job_carries_delivery_options() {
        let mapper = TopicMapper::new("blueplug", QoS::ExactlyOnce, true);
        let job = mapper
            .job(&reading("AA:BB:CC:DD:EE:FF", "battery", 90.0, Unit::Percent))
            .unwrap();
        assert_eq!(job.qos, QoS::ExactlyOnce);
        assert!(job.retain);
        assert_eq!(job.topic, "blueplug/AA:BB:CC:DD:EE:FF/battery");
    }

    #[test]
    fn test_sanitize_topic_segment() {
        assert_eq!(sanitize_topic_segment("Kitchen Sensor"), "Kitchen_Sensor");
        assert_eq!(sanitize_topic_segment("device#1"), "device_1");
        assert_eq!(sanitize_topic_segment("sensor+temp"), "sensor_temp");
        assert_eq!(sanitize_topic_segment("path/to/device"), "path_to_device");
    }

    proptest! {
        #[test]
        fn prop_alias_is_a_single_topic_level(alias in "\\PC{1,32}", metric in "[a-z_]{1,16}") {
            let mapper = TopicMapper::new("blueplug", QoS::AtLeastOnce, false)
                .with_alias(DeviceIdentity::new("AA:BB:CC:DD:EE:FF"), alias);
            let r = reading("AA:BB:CC:DD:EE:FF", &metric, 1.0, Unit::None);
            let topic = mapper.topic(&r);

            prop_assert!(!topic.contains(['#', '+']));
            let levels: Vec<&str> = topic.split('/').collect();
            prop_assert_eq!(levels.len(), 3);
            prop_assert_eq!(levels[2], metric.as_str());
        }
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(7), QoS::ExactlyOnce);
    }
}
