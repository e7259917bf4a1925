//! # Error Types
//!
//! Errors raised while parsing wire representations of the entity model.

use thiserror::Error;

/// A string could not be parsed into one of the entity enums.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    /// Name of the enum being parsed (e.g. `demand subtype`).
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A hex string could not be decoded into a 32-byte hash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashParseError {
    /// Not valid hex.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// Decoded to the wrong number of bytes.
    #[error("Expected 32 bytes, got {0}")]
    WrongLength(usize),
}
