//! ICMP Echo envelope building and parsing.
//!
//! Only the two message types the tunnel rides on are understood: Echo
//! Request (type 8) and Echo Reply (type 0), both with code 0. Everything
//! else parses to an error and is dropped by the caller.

use thiserror::Error;

/// ICMP protocol number in the IPv4 header
pub const ICMP_PROTOCOL: u8 = 1;

/// Minimum IPv4 header size
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

/// ICMP Echo header size (type, code, checksum, identifier, sequence)
pub const ECHO_HEADER_SIZE: usize = 8;

/// Envelope parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IcmpError {
    /// Buffer too short for the header being parsed
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// IP version nibble is not 4 or the header length is invalid
    #[error("not an IPv4 packet (version/IHL byte 0x{0:02X})")]
    NotIpv4(u8),

    /// IPv4 payload is not ICMP
    #[error("IPv4 protocol {0} is not ICMP")]
    NotIcmp(u8),

    /// ICMP message is not an Echo Request / Echo Reply with code 0
    #[error("not an echo message (type {icmp_type}, code {code})")]
    NotEcho {
        /// ICMP type
        icmp_type: u8,
        /// ICMP code
        code: u8,
    },

    /// Internet checksum does not verify
    #[error("invalid ICMP checksum")]
    BadChecksum,
}

/// Echo message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EchoKind {
    /// Echo Reply (type 0)
    Reply = 0,
    /// Echo Request (type 8)
    Request = 8,
}

impl EchoKind {
    /// Parse from the ICMP type byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reply),
            8 => Some(Self::Request),
            _ => None,
        }
    }
}

/// Calculate the Internet checksum (RFC 1071)
pub fn calculate_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }

    // Odd trailing byte is padded with zero
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Verify a message whose checksum field is already filled in
pub fn verify_checksum(data: &[u8]) -> bool {
    calculate_checksum(data) == 0
}

/// Strip the IPv4 header that raw ICMP sockets prepend on receive.
///
/// Honours the IHL field, so headers with options are skipped correctly.
///
/// # Errors
///
/// Returns `IcmpError` if the buffer is not a well-formed IPv4 header
/// carrying ICMP.
pub fn strip_ipv4_header(data: &[u8]) -> Result<&[u8], IcmpError> {
    if data.len() < IPV4_MIN_HEADER_SIZE {
        return Err(IcmpError::TooShort {
            expected: IPV4_MIN_HEADER_SIZE,
            actual: data.len(),
        });
    }

    let version_ihl = data[0];
    let ihl = usize::from(version_ihl & 0x0F) * 4;
    if version_ihl >> 4 != 4 || ihl < IPV4_MIN_HEADER_SIZE {
        return Err(IcmpError::NotIpv4(version_ihl));
    }
    if data.len() < ihl {
        return Err(IcmpError::TooShort {
            expected: ihl,
            actual: data.len(),
        });
    }

    let protocol = data[9];
    if protocol != ICMP_PROTOCOL {
        return Err(IcmpError::NotIcmp(protocol));
    }

    Ok(&data[ihl..])
}

/// Zero-copy view of an ICMP Echo message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoPacket<'a> {
    /// Request or reply
    pub kind: EchoKind,
    /// Identifier field (session token)
    pub identifier: u16,
    /// Sequence number field
    pub sequence: u16,
    /// Echo data
    pub data: &'a [u8],
}

impl<'a> EchoPacket<'a> {
    /// Build an Echo Request view
    pub fn request(identifier: u16, sequence: u16, data: &'a [u8]) -> Self {
        Self {
            kind: EchoKind::Request,
            identifier,
            sequence,
            data,
        }
    }

    /// Build an Echo Reply view
    pub fn reply(identifier: u16, sequence: u16, data: &'a [u8]) -> Self {
        Self {
            kind: EchoKind::Reply,
            identifier,
            sequence,
            data,
        }
    }

    /// Parse a bare ICMP message (no IP header)
    ///
    /// # Errors
    ///
    /// Returns `IcmpError` for short buffers, bad checksums and any message
    /// that is not an echo request/reply with code 0.
    pub fn parse(message: &'a [u8]) -> Result<Self, IcmpError> {
        if message.len() < ECHO_HEADER_SIZE {
            return Err(IcmpError::TooShort {
                expected: ECHO_HEADER_SIZE,
                actual: message.len(),
            });
        }

        let icmp_type = message[0];
        let code = message[1];
        let kind = match EchoKind::from_u8(icmp_type) {
            Some(kind) if code == 0 => kind,
            _ => return Err(IcmpError::NotEcho { icmp_type, code }),
        };

        if !verify_checksum(message) {
            return Err(IcmpError::BadChecksum);
        }

        Ok(Self {
            kind,
            identifier: u16::from_be_bytes([message[4], message[5]]),
            sequence: u16::from_be_bytes([message[6], message[7]]),
            data: &message[ECHO_HEADER_SIZE..],
        })
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        ECHO_HEADER_SIZE + self.data.len()
    }

    /// Serialize into a new buffer with the checksum filled in
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Serialize into `buf`, replacing its contents
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.push(self.kind as u8);
        buf.push(0); // code
        buf.extend_from_slice(&[0, 0]); // checksum placeholder
        buf.extend_from_slice(&self.identifier.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(self.data);

        let checksum = calculate_checksum(buf);
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
}
