//! Frame encoding and decoding for the tunnel wire format.
//!
//! Every ICMP echo message carries exactly one frame in its data field:
//!
//! ```text
//! +-------+---------------+----------------------+
//! | flags | length (u16)  | payload (length)     |
//! +-------+---------------+----------------------+
//!     0       1..3            3..
//! ```
//!
//! The length is big-endian and must account for every trailing byte.

use crate::error::FrameError;
use crate::FRAME_HEADER_SIZE;

/// Frame flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Reserved ping marker; carried but never acted on
    pub const PING: u8 = 0b0000_0001;
    /// Keepalive frame, never delivered to the application
    pub const KEEPALIVE: u8 = 0b0000_0010;

    /// Create new empty flags
    pub fn new() -> Self {
        Self(0)
    }

    /// Wrap a raw flags byte, keeping unknown bits
    pub fn from_u8(bits: u8) -> Self {
        Self(bits)
    }

    /// Add PING flag
    pub fn with_ping(mut self) -> Self {
        self.0 |= Self::PING;
        self
    }

    /// Add KEEPALIVE flag
    pub fn with_keepalive(mut self) -> Self {
        self.0 |= Self::KEEPALIVE;
        self
    }

    /// Check if PING is set
    pub fn is_ping(&self) -> bool {
        self.0 & Self::PING != 0
    }

    /// Check if KEEPALIVE is set
    pub fn is_keepalive(&self) -> bool {
        self.0 & Self::KEEPALIVE != 0
    }

    /// Get raw byte value
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Zero-copy frame view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    flags: FrameFlags,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Data frame carrying `payload`
    pub fn new(flags: FrameFlags, payload: &'a [u8]) -> Self {
        Self { flags, payload }
    }

    /// Empty keepalive frame
    pub fn keepalive() -> Frame<'static> {
        Frame {
            flags: FrameFlags::new().with_keepalive(),
            payload: &[],
        }
    }

    /// Parse a frame from raw bytes (zero-copy)
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` when the header is incomplete and
    /// `FrameError::LengthMismatch` when the declared length is not exactly
    /// the number of bytes that follow it.
    pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let flags = FrameFlags(data[0]);
        let declared = usize::from(u16::from_be_bytes([data[1], data[2]]));
        let payload = &data[FRAME_HEADER_SIZE..];

        if declared != payload.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self { flags, payload })
    }

    /// Get the frame flags
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Get the payload slice (zero-copy)
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Check if this is a keepalive frame
    pub fn is_keepalive(&self) -> bool {
        self.flags.is_keepalive()
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize into a new buffer
    ///
    /// # Errors
    ///
    /// Returns `FrameError::PayloadTooLarge` for payloads over 65535 bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Serialize into `buf`, replacing its contents
    ///
    /// # Errors
    ///
    /// Returns `FrameError::PayloadTooLarge` for payloads over 65535 bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let length = u16::try_from(self.payload.len())
            .map_err(|_| FrameError::PayloadTooLarge(self.payload.len()))?;

        buf.clear();
        buf.push(self.flags.as_u8());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(self.payload);
        Ok(())
    }
}

/// Encode `payload` with `flags`
///
/// # Errors
///
/// Returns `FrameError::PayloadTooLarge` for payloads over 65535 bytes.
pub fn encode(flags: FrameFlags, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Frame::new(flags, payload).encode()
}

/// Decode a frame
///
/// # Errors
///
/// See [`Frame::parse`].
pub fn decode(data: &[u8]) -> Result<Frame<'_>, FrameError> {
    Frame::parse(data)
}
