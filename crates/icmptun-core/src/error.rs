//! Error types for the icmptun core.

use icmptun_transport::TransportError;
use thiserror::Error;

/// Core tunnel errors
#[derive(Debug, Error)]
pub enum Error {
    /// Frame parsing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Frame-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared payload length disagrees with the bytes present
    #[error("payload length mismatch: header says {declared}, got {actual}")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Bytes following the header
        actual: usize,
    },

    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),
}

/// Invalid session configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Client remote must be a concrete host
    #[error("invalid remote address: {0}")]
    InvalidRemote(String),

    /// Identifier 0 is never accepted by a server
    #[error("identify must be nonzero")]
    ZeroIdentify,

    /// Air sequence bounds must be nonzero
    #[error("air sequence bound must be at least 1 (got {0})")]
    ZeroAirSequence(u32),

    /// Air sequence bounds are inverted
    #[error("min air sequence {min} exceeds max {max}")]
    InvertedAirSequence {
        /// Configured minimum
        min: u32,
        /// Configured maximum
        max: u32,
    },

    /// Sequence pool capacity must be a power of two no larger than 32768
    #[error("sequence pool capacity {0} must be a power of two in 1..=32768")]
    InvalidPoolCapacity(usize),

    /// A duration or size that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session has shut down
    #[error("session closed")]
    Closed,

    /// Payload does not fit in a single IPv4 datagram
    #[error("payload too large: {0} bytes (max 65504)")]
    PayloadTooLarge(usize),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Transport could not be opened
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether the session is gone and should be re-established
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
