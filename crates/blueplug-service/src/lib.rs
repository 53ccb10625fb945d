//! BLE to MQTT bridge.
//!
//! This crate provides the `blueplug` daemon, which:
//! - Scans for BLE peripherals and connects to those with known characteristics
//! - Decodes notifications, polled reads and passive advertisement payloads
//! - Publishes every reading to an MQTT broker, queueing through broker outages
//!
//! # Topics
//!
//! - `{prefix}/{device}/{metric}` - one JSON message per reading
//!
//! # Configuration
//!
//! The daemon reads configuration from `~/.config/blueplug/config.toml`:
//!
//! ```toml
//! shutdown_timeout = 10
//!
//! [mqtt]
//! host = "broker.lan"
//! port = 1883
//! client_id = "blueplug-attic"
//! topic_prefix = "home/ble"
//! qos = 1
//! queue_capacity = 1000
//! overflow = "drop-oldest"
//!
//! [scan]
//! dedup_window_ms = 5000
//!
//! [session]
//! max_sessions = 8
//! poll_interval = 60
//!
//! [[devices]]
//! address = "AA:BB:CC:DD:EE:FF"
//! alias = "office"
//! ```

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod mock;
pub mod mqtt;
pub mod queue;
pub mod topic;

pub use bridge::{
    BridgeHandle, BridgeOptions, BridgeReport, BrokerState, BrokerStatus, spawn_bridge,
};
pub use config::{Config, ConfigError, ValidationError, default_config_path};
pub use coordinator::{Coordinator, CoordinatorOptions, ShutdownReport};
pub use mqtt::{BrokerError, BrokerLink, MqttLink, parse_broker_url};
pub use queue::{OutageQueue, OverflowPolicy, PublishJob};
pub use topic::TopicMapper;
