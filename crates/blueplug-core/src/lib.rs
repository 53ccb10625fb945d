//! BLE discovery, GATT sessions and payload decoding for the blueplug bridge.
//!
//! This crate holds everything between the host radio and a decoded
//! [`Reading`](blueplug_types::Reading):
//!
//! - **Radio abstraction**: [`BleAdapter`] and [`BleLink`] traits with a
//!   btleplug backend ([`BtleplugAdapter`]) and a mock backend ([`mock`])
//! - **Scanning**: [`Scanner`] with filtering and per-device deduplication
//! - **Decoding**: [`DecoderRegistry`] with Environmental Sensing, battery,
//!   BTHome v2, Ruuvi and configurable scalar formats
//! - **Sessions**: the [`SessionState`] machine and the per-device task
//!   started by [`spawn_session`]
//!
//! # Platform Differences
//!
//! On macOS, CoreBluetooth hides MAC addresses and devices are identified by
//! a UUID that is stable on one Mac only. On Linux and Windows the identity is
//! the Bluetooth address (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use blueplug_core::{BtleplugAdapter, ScanFilter, ScanOptions, Scanner};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Arc::new(BtleplugAdapter::first().await?);
//!     let mut scanner = Scanner::new(adapter, ScanOptions::default());
//!
//!     let mut stream = scanner.start(ScanFilter::new()).await?;
//!     while let Some(advertisement) = stream.next().await {
//!         let advertisement = advertisement?;
//!         println!("{} rssi={:?}", advertisement.identity, advertisement.rssi);
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod advertisement;
pub mod bthome;
pub mod decoder;
pub mod device;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod retry;
pub mod ruuvi;
pub mod scan;
pub mod session;
pub mod traits;
pub mod util;

pub use adapter::{BtleplugAdapter, get_adapter};
pub use advertisement::Advertisement;
pub use decoder::{Decoder, DecoderFormat, DecoderRegistry, ScalarEncoding, ScalarFormat};
pub use device::BtleplugLink;
pub use error::{Error, Result};
pub use events::{ReportReceiver, ReportSender, SessionPhase, SessionReport, report_channel};
pub use manager::{
    ReadingSender, SessionCommand, SessionContext, SessionHandle, SessionOptions,
    connect_and_match, spawn_session,
};
pub use retry::{RetryConfig, with_retry};
pub use scan::{ScanFilter, ScanOptions, ScanStream, Scanner};
pub use session::{AbandonReason, Session, SessionEvent, SessionState};
pub use traits::{BleAdapter, BleLink, CharProps, GattCharacteristic, GattService, Notification};
pub use util::{create_identifier, format_peripheral_id};

pub use blueplug_types::uuids;
pub use blueplug_types::{DecodeError, DeviceIdentity, Measurement, Reading, ReadingSource, Unit};
