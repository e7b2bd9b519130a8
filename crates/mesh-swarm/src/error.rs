//! Error types for mesh-swarm.

use thiserror::Error;

/// Errors raised while decoding gossip payloads, event keys or message frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended before a complete field could be read.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// The payload was produced by a newer, unknown protocol version.
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u8),

    /// A marker byte was neither added nor removed.
    #[error("invalid marker kind {0:#04x}")]
    InvalidMarker(u8),

    /// An event key has an impossible length.
    #[error("invalid event key length {0}")]
    InvalidKeyLength(usize),

    /// An event key names a peer outside the 48-bit name space.
    #[error("invalid peer name {0:#x} in event key")]
    InvalidPeerName(u64),

    /// The same key appeared twice in one state payload.
    #[error("duplicate key in state payload")]
    DuplicateKey,

    /// Bytes remained after the last declared entry.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Errors that can occur in swarm operations.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A bind, advertise or peer address could not be parsed or resolved.
    #[error("invalid address '{addr}': {reason}")]
    Address {
        /// The address as given.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An ssid has more parts than an event key can carry.
    #[error("ssid has {parts} parts, at most {max} allowed")]
    SsidTooLong {
        /// Parts in the rejected ssid.
        parts: usize,
        /// Largest accepted number of parts.
        max: usize,
    },

    /// A message field is longer than the frame layout can carry.
    #[error("message {field} is {len} bytes, at most {max} allowed")]
    FieldTooLong {
        /// Name of the oversized field.
        field: &'static str,
        /// Length of the field.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// A gossip payload or frame failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The transport refused or failed an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Builds an [`SwarmError::Address`] error.
    pub(crate) fn address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Address {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}
