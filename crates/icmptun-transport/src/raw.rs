//! Raw ICMPv4 socket transport.
//!
//! Opens an `AF_INET`/`SOCK_RAW`/`IPPROTO_ICMP` socket through `socket2`
//! and drives it with Tokio. The kernel prepends the IPv4 header to every
//! received datagram; it is stripped here so sessions only ever see ICMP.
//!
//! Raw sockets require `CAP_NET_RAW` (or root) on Linux.

use crate::icmp::strip_ipv4_header;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Kernel receive buffer requested for the raw socket
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Raw ICMPv4 transport using Tokio.
///
/// # Examples
///
/// ```no_run
/// use icmptun_transport::raw::RawIcmpTransport;
/// use icmptun_transport::transport::Transport;
/// use std::net::Ipv4Addr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RawIcmpTransport::bind(Ipv4Addr::UNSPECIFIED)?;
/// println!("Listening on {}", transport.local_addr()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RawIcmpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<watch::Sender<bool>>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    recv_errors: Arc<AtomicU64>,
}

impl RawIcmpTransport {
    /// Open a raw ICMP socket bound to `local`.
    ///
    /// Must be called from within a Tokio runtime. Use
    /// `Ipv4Addr::UNSPECIFIED` to receive on every interface.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// (typically missing `CAP_NET_RAW`) or bound.
    pub fn bind(local: Ipv4Addr) -> TransportResult<Self> {
        let socket2 = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::RAW,
            Some(socket2::Protocol::ICMPV4),
        )
        .map_err(|e| TransportError::BindFailed(format!("raw ICMP socket: {e}")))?;

        socket2
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let addr = SocketAddr::new(IpAddr::V4(local), 0);
        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{local}: {e}")))?;

        // Tokio's datagram socket only issues sendto/recvfrom, which is all a
        // raw socket needs.
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        tracing::debug!("Raw ICMP socket bound on {}", local);

        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(closed),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received: Arc::new(AtomicU64::new(0)),
            send_errors: Arc::new(AtomicU64::new(0)),
            recv_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn recv_raw(&self, buf: &mut [u8]) -> TransportResult<(usize, IpAddr)> {
        loop {
            let (size, from) = match self.socket.recv_from(buf).await {
                Ok(received) => received,
                Err(e) => {
                    self.recv_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(TransportError::Io(e));
                }
            };

            let from = from.ip();
            if !from.is_ipv4() {
                self.recv_errors.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::UnexpectedAddress(from.to_string()));
            }

            let header_len = match strip_ipv4_header(&buf[..size]) {
                Ok(icmp) => size - icmp.len(),
                Err(e) => {
                    tracing::trace!("Dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            buf.copy_within(header_len..size, 0);
            let icmp_len = size - header_len;

            self.bytes_received
                .fetch_add(icmp_len as u64, Ordering::Relaxed);
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            return Ok((icmp_len, from));
        }
    }
}

#[async_trait]
impl Transport for RawIcmpTransport {
    async fn send_to(&self, buf: &[u8], addr: IpAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !addr.is_ipv4() {
            return Err(TransportError::UnexpectedAddress(addr.to_string()));
        }

        match self.socket.send_to(buf, SocketAddr::new(addr, 0)).await {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, IpAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            received = self.recv_raw(buf) => received,
        }
    }

    fn local_addr(&self) -> TransportResult<IpAddr> {
        Ok(self.socket.local_addr().map_err(TransportError::Io)?.ip())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            // Losses after the kernel accepts a datagram are not observable
            packets_dropped: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::{EchoKind, EchoPacket};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_raw_bind_reports_failure_cleanly() {
        // Unprivileged test runners cannot open raw sockets; both outcomes
        // must be well-formed.
        match RawIcmpTransport::bind(Ipv4Addr::LOCALHOST) {
            Ok(transport) => {
                assert!(!transport.is_closed());
                assert_eq!(
                    transport.local_addr().unwrap(),
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                );
            }
            Err(e) => assert!(matches!(e, TransportError::BindFailed(_))),
        }
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_RAW"]
    async fn test_raw_loopback_echo() {
        let transport = RawIcmpTransport::bind(Ipv4Addr::LOCALHOST).unwrap();
        let request = EchoPacket::request(0xBEEF, 1, b"loopback").encode();
        transport
            .send_to(&request, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();

        // Loopback delivers our own request first, then the kernel's reply
        let mut buf = vec![0u8; 1500];
        let mut seen_reply = false;
        for _ in 0..4 {
            let (size, _) = timeout(Duration::from_secs(1), transport.recv_from(&mut buf))
                .await
                .expect("Timeout")
                .unwrap();
            let packet = EchoPacket::parse(&buf[..size]).unwrap();
            if packet.kind == EchoKind::Reply && packet.identifier == 0xBEEF {
                assert_eq!(packet.data, b"loopback");
                seen_reply = true;
                break;
            }
        }
        assert!(seen_reply);
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_RAW"]
    async fn test_raw_close_wakes_receiver() {
        let transport = RawIcmpTransport::bind(Ipv4Addr::LOCALHOST).unwrap();
        let reader = transport.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            reader.recv_from(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("receiver not woken")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
