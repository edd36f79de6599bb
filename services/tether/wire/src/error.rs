//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A header field does not fit in its bit width
    #[error("{field} {value} exceeds maximum {max}")]
    FieldTooLarge {
        /// Name of the offending field
        field: &'static str,
        /// Value that was supplied
        value: usize,
        /// Largest value the field can carry
        max: usize,
    },

    /// Unknown control subtype
    #[error("unknown control subtype {0}")]
    Control(u8),

    /// Malformed ciphertext envelope
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),

    /// AEAD encryption or authentication failure
    #[error("aead failure")]
    Crypto,

    /// Key material could not be derived
    #[error("invalid key material")]
    Key,
}
