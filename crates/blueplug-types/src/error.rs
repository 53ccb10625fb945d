//! Error types for payload decoding in blueplug-types.

use thiserror::Error;

/// Errors that can occur when decoding a raw sensor payload.
///
/// Decoding failures are per-payload: the caller logs them and moves on to
/// the next notification or advertisement.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The payload is shorter than the format requires.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// A field holds a value outside its valid range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The payload announces a format version this decoder does not handle.
    #[error("Unsupported payload format: 0x{0:02X}")]
    UnsupportedFormat(u8),

    /// The payload is encrypted and no key is configured.
    #[error("Encrypted payload")]
    Encrypted,
}

impl DecodeError {
    /// Create an insufficient-bytes error.
    pub fn insufficient(expected: usize, actual: usize) -> Self {
        Self::InsufficientBytes { expected, actual }
    }
}

/// Result type alias using blueplug-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
