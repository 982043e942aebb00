//! # Bus Errors
//!
//! Error taxonomy for the messaging layer.
//!
//! - [`DecodeError`] never leaves a listen loop: the frame is dropped and the
//!   loop continues.
//! - [`BusError`] is what `publish`, `send` and `request` callers see.

use std::time::Duration;
use thiserror::Error;

use crate::address::ChannelKind;

/// Malformed wire frame.
///
/// Produced only by [`crate::envelope::EnvelopeCodec::decode`]. Every variant is
/// reachable from attacker-controlled bytes, so decoding must return one of
/// these instead of panicking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the frame layout requires.
    #[error("truncated frame: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Length prefix exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Length prefix disagrees with the number of bytes that followed it.
    #[error("length prefix says {declared} bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Version bits name a protocol this build does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Topic length was zero.
    #[error("empty topic")]
    EmptyTopic,

    /// Topic bytes are not UTF-8.
    #[error("topic is not valid UTF-8")]
    InvalidTopic,
}

/// Errors surfaced to callers of the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Socket-level failure while sending or receiving.
    #[error("transport error during {op}: {reason}")]
    Transport { op: &'static str, reason: String },

    /// No reply arrived before the deadline.
    #[error("request on topic {topic:?} timed out after {after:?}")]
    TimedOut { topic: String, after: Duration },

    /// The channel needed for this call is not configured.
    #[error("{0} channel is not configured")]
    ChannelUnavailable(ChannelKind),

    /// The bus is closing (or closed).
    #[error("bus is shutting down")]
    ShuttingDown,

    /// The encoded envelope would not fit in one frame.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Topic is empty, too long, or uses the reserved prefix.
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),

    /// The serving side's handlers failed while producing a reply.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Start-up configuration is unusable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Wrap an I/O error raised during `op`.
    pub(crate) fn transport(op: &'static str, err: std::io::Error) -> Self {
        Self::Transport {
            op,
            reason: err.to_string(),
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Transport { .. })
    }
}

/// Errors from loading or validating [`crate::config::BusConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: String },

    /// TOML parsing error.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// Address string could not be parsed or resolved.
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// A tuning value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
