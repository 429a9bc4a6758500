// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the thing engine.
//!
//! Each failure domain has its own enum so callers can match on exactly
//! what can go wrong at that seam. [`ThingError`] wraps all of them for
//! code that only needs to propagate.

use thiserror::Error;

/// Result type for operations that can fail in more than one domain.
pub type Result<T> = core::result::Result<T, ThingError>;

/// Failures of [`Registry::register`](crate::registry::Registry::register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The slot is already occupied.
    #[error("data item {0} is already registered")]
    DuplicateId(u8),

    /// The id does not fit the registry capacity.
    #[error("data item id {id} out of range (capacity {capacity})")]
    OutOfRange { id: u8, capacity: usize },

    /// The (type_id, value_type, unit) triple is not in the validity tables.
    #[error("invalid schema: type_id=0x{type_id:04x} value_type={value_type} unit={unit}")]
    InvalidSchema {
        type_id: u16,
        value_type: u8,
        unit: u8,
    },

    /// Bound cell size does not match the value type.
    #[error("binding of {len} bytes is incompatible with the value type")]
    InvalidBinding { len: usize },
}

/// Failures of [`Registry::configure`](crate::registry::Registry::configure).
///
/// A rejected configuration leaves the previous one untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("data item {0} is not registered")]
    NotRegistered(u8),

    #[error("unknown event flag bits 0x{0:02x}")]
    UnknownFlags(u8),

    #[error("TIME event requires a non-zero period")]
    MissingPeriod,

    #[error("period is only allowed with the TIME event")]
    UnexpectedPeriod,

    #[error("threshold event is missing its limit")]
    MissingLimit,

    #[error("limit given without its threshold event")]
    UnexpectedLimit,

    #[error("thresholds are only supported for int and float items")]
    ThresholdUnsupported,

    #[error("limit type does not match the item value type")]
    LimitTypeMismatch,

    #[error("upper limit is below lower limit")]
    InvertedLimits,
}

/// Failures of [`Registry::write`](crate::registry::Registry::write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("data item {0} is not registered")]
    NotRegistered(u8),

    #[error("value type does not match the item schema")]
    TypeMismatch,

    #[error("raw value of {len} bytes exceeds the bound buffer ({capacity} bytes)")]
    TooLarge { len: usize, capacity: usize },

    /// The application refused the value; the previous value was restored.
    #[error("application rejected the written value")]
    CallbackRejected,
}

/// Wire format errors. Malformed input never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("payload length mismatch for opcode 0x{opcode:02x}: {len} bytes")]
    PayloadLengthMismatch { opcode: u8, len: usize },

    #[error("unknown value type {0}")]
    UnknownValueType(u8),

    #[error("value does not fit its type")]
    InvalidValue,

    #[error("string field is not valid UTF-8")]
    InvalidString,
}

/// Identity persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored identity is corrupt ({0} bytes)")]
    Corrupt(usize),
}

/// Transport-level errors. I/O errors keep only their message so the type stays `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {0} bytes exceeds the receive buffer")]
    FrameTooLarge(usize),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Error reported by application callbacks and data sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("application callback failed: {reason}")]
pub struct AppError {
    pub reason: String,
}

impl AppError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Umbrella error.
#[derive(Debug, Error)]
pub enum ThingError {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config file I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("worker thread panicked: {0}")]
    Worker(&'static str),
}
