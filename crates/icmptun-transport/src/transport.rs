//! Transport trait abstraction for ICMP datagram backends.
//!
//! This module defines the `Transport` trait that sessions use to move whole
//! ICMP messages. Implementations hide whether messages travel over a raw
//! kernel socket or an in-process channel, and always hand the session a
//! bare ICMP message (no IP header).

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Receive did not complete before the read deadline
    #[error("Receive timed out")]
    Timeout,

    /// Sender address is not of the expected family
    #[error("Unexpected source address: {0}")]
    UnexpectedAddress(String),
}

impl TransportError {
    /// Whether this error only signals an expired receive deadline.
    ///
    /// Sessions treat timeouts as a cue to re-check cancellation and never
    /// surface them to callers.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport for ICMP messages.
///
/// A transport is written by exactly one task and read by exactly one task,
/// so implementations only need `&self` access.
///
/// # Examples
///
/// ```no_run
/// use icmptun_transport::raw::RawIcmpTransport;
/// use icmptun_transport::transport::Transport;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RawIcmpTransport::bind(Ipv4Addr::UNSPECIFIED)?;
///
/// // Send a prepared ICMP message
/// let message = [8u8, 0, 0xf7, 0xff, 0, 0, 0, 0];
/// transport.send_to(&message, IpAddr::V4(Ipv4Addr::LOCALHOST)).await?;
///
/// // Receive the next ICMP message
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one ICMP message to a remote host.
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails
    async fn send_to(&self, buf: &[u8], addr: IpAddr) -> TransportResult<usize>;

    /// Receive one ICMP message.
    ///
    /// Fills `buf` with the ICMP message (IP header already removed) and
    /// returns its length and the sender's address.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, IpAddr)>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<IpAddr>;

    /// Close the transport and release resources.
    ///
    /// After calling this method, all subsequent operations return
    /// `TransportError::Closed` and pending receives are woken.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
    /// Datagrams accepted for sending but lost before delivery
    pub packets_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::UnexpectedAddress("::1".to_string());
        assert!(err.to_string().contains("::1"));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(TransportError::Timeout.is_timeout());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_timeout());
        assert!(TransportError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_timeout());

        assert!(!TransportError::Closed.is_timeout());
        assert!(!TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_timeout());
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }
}
