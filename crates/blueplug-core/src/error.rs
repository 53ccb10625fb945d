//! Error types for blueplug-core.
//!
//! This module defines the errors that can occur while scanning for,
//! connecting to and streaming from BLE peripherals.
//!
//! # Error classes
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | [`Error::AdapterUnavailable`] | process | Fatal at startup, retried with backoff at runtime |
//! | [`Error::LinkLost`] | session | Session moves to `Disconnected`, then retries or is abandoned |
//! | [`Error::OperationTimeout`] | session | Same as link loss |
//! | [`Error::Bluetooth`] | session | Treated as link loss |
//! | [`Error::Decode`] | reading | Logged and skipped, the stream continues |
//! | [`Error::InvalidTransition`] | session | Programming error, the transition is refused |
//! | [`Error::InvalidConfig`] | process | Fix configuration and restart |

use std::time::Duration;

use blueplug_types::DecodeError;
use thiserror::Error;

/// Errors that can occur when talking to the host radio or a peripheral.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error reported by the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No usable radio adapter (missing, powered off, or refusing to scan).
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The link to a peripheral went away.
    #[error("Link to {device} lost")]
    LinkLost {
        /// Identity of the peripheral.
        device: String,
    },

    /// A radio operation did not complete in time.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    OperationTimeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The peripheral is not known to the adapter.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A characteristic was addressed that service discovery did not report.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        /// Service UUID.
        service: String,
        /// Characteristic UUID.
        characteristic: String,
    },

    /// A payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A session state machine refused an event.
    #[error("Invalid transition: {event} is not accepted in state {state}")]
    InvalidTransition {
        /// State the machine was in.
        state: &'static str,
        /// Event that was refused.
        event: &'static str,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an adapter-unavailable error.
    pub fn adapter_unavailable(reason: impl Into<String>) -> Self {
        Self::AdapterUnavailable(reason.into())
    }

    /// Create a link-lost error for a device.
    pub fn link_lost(device: impl ToString) -> Self {
        Self::LinkLost {
            device: device.to_string(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::OperationTimeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(service: impl ToString, characteristic: impl ToString) -> Self {
        Self::CharacteristicNotFound {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error means the radio adapter itself is unusable.
    pub fn is_adapter_unavailable(&self) -> bool {
        matches!(self, Error::AdapterUnavailable(_))
    }

    /// Whether this error ends the current link.
    ///
    /// Link-ending errors move a session to `Disconnected`; anything else is
    /// local to the operation that produced it.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::LinkLost { .. }
                | Error::OperationTimeout { .. }
                | Error::Bluetooth(_)
                | Error::AdapterUnavailable(_)
                | Error::DeviceNotFound(_)
        )
    }
}

/// Result type alias using blueplug-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::adapter_unavailable("no adapter found");
        assert_eq!(
            err.to_string(),
            "Bluetooth adapter unavailable: no adapter found"
        );

        let err = Error::link_lost("AA:BB:CC:DD:EE:FF");
        assert_eq!(err.to_string(), "Link to AA:BB:CC:DD:EE:FF lost");

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));

        let err = Error::InvalidTransition {
            state: "Discovered",
            event: "Subscribed",
        };
        assert!(err.to_string().contains("Discovered"));
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: Error = DecodeError::insufficient(2, 1).into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(Error::link_lost("x").is_link_failure());
        assert!(Error::timeout("read", Duration::from_secs(1)).is_link_failure());
        assert!(!Error::Cancelled.is_link_failure());
        assert!(!Error::invalid_config("bad").is_link_failure());
        assert!(Error::adapter_unavailable("off").is_adapter_unavailable());
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }
}
