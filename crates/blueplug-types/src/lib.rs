//! Platform-agnostic types for the blueplug BLE to MQTT bridge.
//!
//! This crate holds the data that flows through the bridge without pulling
//! in any Bluetooth or async runtime dependency:
//!
//! - [`DeviceIdentity`] - normalized peripheral address or platform id
//! - [`Measurement`] and [`Reading`] - decoder output and the published unit of data
//! - [`DecodeError`] - per-payload decoding failures
//! - UUID constants for the standard characteristics handled out of the box
//!
//! # Example
//!
//! ```
//! use blueplug_types::{DeviceIdentity, Measurement, Reading, ReadingSource, Unit};
//! use time::OffsetDateTime;
//!
//! let reading = Reading::from_measurement(
//!     DeviceIdentity::new("aa:bb:cc:dd:ee:ff"),
//!     ReadingSource::ManufacturerData { company_id: 0x0499 },
//!     Measurement::new("temperature", 21.5, Unit::Celsius),
//!     OffsetDateTime::now_utc(),
//! );
//! assert_eq!(reading.device.as_str(), "AA:BB:CC:DD:EE:FF");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{DecodeError, DecodeResult};
pub use types::{DeviceIdentity, Measurement, Reading, ReadingSource, Unit};
pub use uuid as uuids;
