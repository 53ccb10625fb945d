//! Bridge configuration.
//!
//! Read from `~/.config/blueplug/config.toml` when present. Every section is
//! optional; missing keys take their defaults. Command-line flags are applied
//! on top by the binary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blueplug_core::scan::name_matches;
use blueplug_core::{
    Advertisement, Decoder, DecoderFormat, DecoderRegistry, RetryConfig, ScanFilter, ScanOptions,
    SessionOptions,
};
use blueplug_types::{DeviceIdentity, ReadingSource};

use crate::bridge::BridgeOptions;
use crate::coordinator::CoordinatorOptions;
use crate::queue::OverflowPolicy;
use crate::topic::{TopicMapper, qos_from_level};

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds to wait for sessions to release their links on shutdown.
    pub shutdown_timeout: u64,
    /// Broker settings.
    pub mqtt: MqttConfig,
    /// Scanner settings.
    pub scan: ScanConfig,
    /// Device session settings.
    pub session: SessionConfig,
    /// Additional characteristic decoders.
    pub decoders: Vec<DecoderConfig>,
    /// Devices with an alias or that should be connected regardless of
    /// their advertised services.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shutdown_timeout: 10,
            mqtt: MqttConfig::default(),
            scan: ScanConfig::default(),
            session: SessionConfig::default(),
            decoders: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use blueplug_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.shutdown_timeout == 0 {
            errors.push(ValidationError::new(
                "shutdown_timeout",
                "must be at least 1 second",
            ));
        }

        errors.extend(self.mqtt.validate());
        errors.extend(self.scan.validate());
        errors.extend(self.session.validate());

        let mut seen_characteristics = HashSet::new();
        for (i, decoder) in self.decoders.iter().enumerate() {
            let prefix = format!("decoders[{}]", i);
            errors.extend(decoder.validate(&prefix));

            if !seen_characteristics.insert((decoder.service, decoder.characteristic)) {
                errors.push(ValidationError::new(
                    format!("{}.characteristic", prefix),
                    format!(
                        "duplicate decoder for characteristic {}",
                        decoder.characteristic
                    ),
                ));
            }
        }

        let mut seen_addresses = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if let Some(address) = &device.address
                && !seen_addresses.insert(DeviceIdentity::new(address))
            {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    format!("duplicate device address '{}'", address),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Built-in decoders plus the `[[decoders]]` entries.
    pub fn registry(&self) -> DecoderRegistry {
        self.decoders
            .iter()
            .fold(DecoderRegistry::with_builtin(), |registry, entry| {
                registry.register(entry.service, entry.characteristic, entry.decoder())
            })
    }

    /// Topic mapper with the configured prefix, address aliases and
    /// per-decoder topic templates.
    pub fn topic_mapper(&self) -> TopicMapper {
        let mut mapper = TopicMapper::new(
            &self.mqtt.topic_prefix,
            qos_from_level(self.mqtt.qos),
            self.mqtt.retain,
        );
        for device in &self.devices {
            if let (Some(address), Some(alias)) = (&device.address, &device.alias) {
                mapper.set_alias(DeviceIdentity::new(address), alias);
            }
        }
        for decoder in &self.decoders {
            if let Some(topic) = &decoder.topic {
                mapper = mapper.with_override(decoder.source(), topic);
            }
        }
        mapper
    }

    /// Options for the publish bridge task.
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions::default()
            .queue_capacity(self.mqtt.queue_capacity)
            .overflow(self.mqtt.overflow)
            .flush_timeout(Duration::from_secs(self.mqtt.flush_timeout))
            .reconnect(self.mqtt.reconnect.to_retry_config())
    }

    /// Options for the coordinator and the sessions it spawns.
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions::default()
            .session(self.session.options())
            .max_sessions(self.session.max_sessions)
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
            .scan_filter(self.scan.filter())
            .scan_options(self.scan.options())
            .devices(self.devices.clone())
    }
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Connect over TLS.
    pub tls: bool,
    /// Username for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Seconds to wait for the broker to accept a connection.
    pub connect_timeout: u64,
    /// Seconds to wait for a delivery confirmation.
    pub ack_timeout: u64,
    /// First topic level of every published message.
    pub topic_prefix: String,
    /// QoS level (0, 1, or 2).
    pub qos: u8,
    /// Ask the broker to retain messages.
    pub retain: bool,
    /// Jobs held while the broker is unreachable.
    pub queue_capacity: usize,
    /// Which job to discard when the queue is full.
    pub overflow: OverflowPolicy,
    /// Seconds allowed for flushing the queue on shutdown.
    pub flush_timeout: u64,
    /// Reconnect backoff.
    pub reconnect: BackoffConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: "blueplug".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
            username: None,
            password: None,
            keep_alive: 30,
            connect_timeout: 10,
            ack_timeout: 10,
            topic_prefix: "blueplug".to_string(),
            qos: 1,
            retain: false,
            queue_capacity: 1000,
            overflow: OverflowPolicy::DropOldest,
            flush_timeout: 5,
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Minimum keep-alive accepted by the MQTT client, in seconds.
pub const MIN_KEEP_ALIVE: u64 = 5;

impl MqttConfig {
    /// Validate MQTT configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.client_id.is_empty() {
            errors.push(ValidationError::new(
                "mqtt.client_id",
                "client id cannot be empty",
            ));
        }
        if self.host.is_empty() {
            errors.push(ValidationError::new("mqtt.host", "host cannot be empty"));
        }
        if self.port == 0 {
            errors.push(ValidationError::new("mqtt.port", "port cannot be 0"));
        }
        if self.username.is_some() != self.password.is_some() {
            errors.push(ValidationError::new(
                "mqtt.username",
                "username and password must be set together",
            ));
        }
        if self.keep_alive < MIN_KEEP_ALIVE {
            errors.push(ValidationError::new(
                "mqtt.keep_alive",
                format!(
                    "keep alive {} is too short (minimum {} seconds)",
                    self.keep_alive, MIN_KEEP_ALIVE
                ),
            ));
        }
        if self.connect_timeout == 0 {
            errors.push(ValidationError::new(
                "mqtt.connect_timeout",
                "must be at least 1 second",
            ));
        }
        if self.ack_timeout == 0 {
            errors.push(ValidationError::new(
                "mqtt.ack_timeout",
                "must be at least 1 second",
            ));
        }
        if self.topic_prefix.is_empty() {
            errors.push(ValidationError::new(
                "mqtt.topic_prefix",
                "topic prefix cannot be empty",
            ));
        } else if self.topic_prefix.contains(['#', '+']) {
            errors.push(ValidationError::new(
                "mqtt.topic_prefix",
                format!(
                    "topic prefix '{}' cannot contain wildcards",
                    self.topic_prefix
                ),
            ));
        }
        if self.qos > 2 {
            errors.push(ValidationError::new(
                "mqtt.qos",
                format!("invalid QoS {}: must be 0, 1, or 2", self.qos),
            ));
        }
        if self.queue_capacity == 0 {
            errors.push(ValidationError::new(
                "mqtt.queue_capacity",
                "queue capacity must be at least 1",
            ));
        }
        errors.extend(self.reconnect.validate("mqtt.reconnect"));

        errors
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Unbounded retry schedule with these delays.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(u32::MAX)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff_multiplier(self.multiplier)
    }

    fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.initial_delay_ms == 0 {
            errors.push(ValidationError::new(
                format!("{}.initial_delay_ms", prefix),
                "initial delay must be positive",
            ));
        }
        if let Err(e) = self.to_retry_config().validate() {
            errors.push(ValidationError::new(prefix, e.to_string()));
        }

        errors
    }
}

/// Scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Only report advertisers of these services.
    pub services: Vec<Uuid>,
    /// Only report advertisers whose name matches (`*` wildcard).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    /// Window in milliseconds within which repeated advertisements of one
    /// device are coalesced.
    pub dedup_window_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            name_pattern: None,
            dedup_window_ms: 5000,
        }
    }
}

impl ScanConfig {
    /// Validate scanner configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(pattern) = &self.name_pattern
            && pattern.trim().is_empty()
        {
            errors.push(ValidationError::new(
                "scan.name_pattern",
                "name pattern cannot be empty (omit it instead)",
            ));
        }

        errors
    }

    /// Scanner filter.
    pub fn filter(&self) -> ScanFilter {
        let filter = self
            .services
            .iter()
            .fold(ScanFilter::new(), |filter, uuid| filter.service(*uuid));
        match &self.name_pattern {
            Some(pattern) => filter.name_pattern(pattern),
            None => filter,
        }
    }

    /// Scanner options.
    pub fn options(&self) -> ScanOptions {
        ScanOptions::default().dedup_window(Duration::from_millis(self.dedup_window_ms))
    }
}

/// Device session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds allowed for a connection attempt.
    pub connect_timeout: u64,
    /// Seconds allowed for service discovery.
    pub discovery_timeout: u64,
    /// Seconds between reads of characteristics without notify support.
    pub poll_interval: u64,
    /// Seconds between link liveness checks.
    pub liveness_interval: u64,
    /// Upper bound on concurrent sessions.
    pub max_sessions: usize,
    /// Reconnect budget after link loss.
    pub retry: SessionRetryConfig,
}

/// Minimum poll interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 1;
/// Maximum poll interval in seconds (1 hour).
pub const MAX_POLL_INTERVAL: u64 = 3600;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            discovery_timeout: 15,
            poll_interval: 60,
            liveness_interval: 30,
            max_sessions: 8,
            retry: SessionRetryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Validate session configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("session.connect_timeout", self.connect_timeout),
            ("session.discovery_timeout", self.discovery_timeout),
            ("session.liveness_interval", self.liveness_interval),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(field, "must be at least 1 second"));
            }
        }

        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.poll_interval) {
            errors.push(ValidationError::new(
                "session.poll_interval",
                format!(
                    "poll interval {} is out of range ({}-{} seconds)",
                    self.poll_interval, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL
                ),
            ));
        }
        if self.max_sessions == 0 {
            errors.push(ValidationError::new(
                "session.max_sessions",
                "at least one session must be allowed",
            ));
        }
        if let Err(e) = self.retry.to_retry_config().validate() {
            errors.push(ValidationError::new("session.retry", e.to_string()));
        }

        errors
    }

    /// Options for spawned sessions.
    pub fn options(&self) -> SessionOptions {
        SessionOptions::default()
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .discovery_timeout(Duration::from_secs(self.discovery_timeout))
            .poll_interval(Duration::from_secs(self.poll_interval))
            .liveness_interval(Duration::from_secs(self.liveness_interval))
            .retry(self.retry.to_retry_config())
    }
}

/// Reconnect budget of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRetryConfig {
    /// Reconnect attempts before the session is abandoned.
    pub max_retries: u32,
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for SessionRetryConfig {
    fn default() -> Self {
        let retry = RetryConfig::for_reconnect();
        Self {
            max_retries: retry.max_retries,
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            multiplier: retry.backoff_multiplier,
        }
    }
}

impl SessionRetryConfig {
    /// Retry schedule for sessions.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::for_reconnect()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff_multiplier(self.multiplier)
    }
}

/// A decoder for one GATT characteristic.
///
/// ```toml
/// [[decoders]]
/// service = "0000181a-0000-1000-8000-00805f9b34fb"
/// characteristic = "00002a6e-0000-1000-8000-00805f9b34fb"
/// format = "scalar"
/// encoding = "i16_le"
/// scale = 0.01
/// unit = "°C"
/// metric = "temperature"
/// topic = "climate/{device}/{metric}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// GATT service UUID.
    pub service: Uuid,
    /// GATT characteristic UUID.
    pub characteristic: Uuid,
    /// Payload format and its parameters.
    #[serde(flatten)]
    pub format: DecoderFormat,
    /// Metric name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    /// Topic template override (`{prefix}`, `{device}`, `{metric}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl DecoderConfig {
    /// The decoder this entry describes.
    pub fn decoder(&self) -> Decoder {
        let decoder = Decoder::new(self.format.clone());
        match &self.metric {
            Some(metric) => decoder.with_metric(metric),
            None => decoder,
        }
    }

    /// Source tag carried by readings from this characteristic.
    pub fn source(&self) -> ReadingSource {
        ReadingSource::Characteristic {
            service: self.service,
            characteristic: self.characteristic,
        }
    }

    /// Validate decoder configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(metric) = &self.metric
            && metric.is_empty()
        {
            errors.push(ValidationError::new(
                format!("{}.metric", prefix),
                "metric cannot be empty string (omit it instead)",
            ));
        }

        if let Some(topic) = &self.topic {
            if topic.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.topic", prefix),
                    "topic cannot be empty string (omit it instead)",
                ));
            } else if topic.contains(['#', '+']) {
                errors.push(ValidationError::new(
                    format!("{}.topic", prefix),
                    format!("topic '{}' cannot contain wildcards", topic),
                ));
            }
        }

        if let DecoderFormat::Scalar(scalar) = &self.format
            && !scalar.scale.is_finite()
        {
            errors.push(ValidationError::new(
                format!("{}.scale", prefix),
                "scale must be a finite number",
            ));
        }

        errors
    }
}

/// A device to connect to or publish under an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device address or platform identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Advertised name pattern (`*` wildcard).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Friendly alias used in topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DeviceConfig {
    /// Whether an advertisement comes from this device.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if let Some(address) = &self.address
            && DeviceIdentity::new(address) == advertisement.identity
        {
            return true;
        }
        match (&self.name, &advertisement.name) {
            (Some(pattern), Some(name)) => name_matches(pattern, name),
            _ => false,
        }
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match (&self.address, &self.name) {
            (None, None) => errors.push(ValidationError::new(
                prefix,
                "either address or name must be set",
            )),
            (Some(address), _) if address.trim().is_empty() => {
                errors.push(ValidationError::new(
                    format!("{}.address", prefix),
                    "device address cannot be empty",
                ));
            }
            (_, Some(name)) if name.trim().is_empty() => {
                errors.push(ValidationError::new(
                    format!("{}.name", prefix),
                    "device name cannot be empty",
                ));
            }
            _ => {}
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError::new(
                format!("{}.alias", prefix),
                "alias cannot be empty string (use null/omit instead)",
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `mqtt.port` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blueplug")
        .join("config.toml")
}
