//! Local endpoints a tunnel session can be attached to.

use icmptun_core::{PacketConn, SessionError};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Payload sent by the test pipe
pub const HEARTBEAT_PAYLOAD: &[u8] = b"icmptun heartbeat";

/// Interval between test pipe heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Largest UDP datagram the relay accepts
const MAX_UDP_DATAGRAM: usize = 65535;

/// Where tunnel payloads come from and go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipe {
    /// Send a fixed heartbeat every second and print whatever arrives
    Test,
    /// Relay datagrams between the tunnel and a local UDP socket
    Udp(SocketAddr),
}

impl FromStr for Pipe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("test") {
            return Ok(Self::Test);
        }
        match s.split_once(':') {
            Some((scheme, addr)) if scheme.eq_ignore_ascii_case("udp") => addr
                .parse()
                .map(Self::Udp)
                .map_err(|_| format!("invalid UDP address '{}'", addr)),
            _ => Err(format!(
                "unknown pipe '{}' (expected 'test' or 'udp:<addr:port>')",
                s
            )),
        }
    }
}

impl std::fmt::Display for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Udp(addr) => write!(f, "udp:{}", addr),
        }
    }
}

impl Pipe {
    /// Run the pipe until the session closes
    ///
    /// # Errors
    ///
    /// Returns an error if the local endpoint fails.
    pub async fn run(&self, conn: Arc<dyn PacketConn>) -> anyhow::Result<()> {
        match self {
            Self::Test => run_test(conn).await,
            Self::Udp(addr) => UdpRelay::bind(*addr).await?.run(conn).await,
        }
    }
}

/// Treat a closed session as a clean stop
fn closed_is_ok(result: Result<(), SessionError>) -> anyhow::Result<()> {
    match result {
        Err(e) if e.is_closed() => Ok(()),
        other => other.map_err(Into::into),
    }
}

async fn run_test(conn: Arc<dyn PacketConn>) -> anyhow::Result<()> {
    let conn = conn.as_ref();
    closed_is_ok(tokio::try_join!(send_heartbeats(conn), print_received(conn)).map(|_| ()))
}

async fn send_heartbeats(conn: &dyn PacketConn) -> Result<(), SessionError> {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        conn.enqueue(HEARTBEAT_PAYLOAD.to_vec()).await?;
    }
}

async fn print_received(conn: &dyn PacketConn) -> Result<(), SessionError> {
    loop {
        let payload = conn.dequeue().await?;
        println!(
            "received {} bytes: {}",
            payload.len(),
            String::from_utf8_lossy(&payload)
        );
    }
}

/// Relays datagrams between a local UDP socket and a tunnel session.
///
/// Tunnel payloads go back to whichever local address sent most recently;
/// they are dropped until some local application has sent something.
pub struct UdpRelay {
    socket: UdpSocket,
    last_peer: Mutex<Option<SocketAddr>>,
}

impl UdpRelay {
    /// Bind the local UDP socket
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("UDP relay listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            last_peer: Mutex::new(None),
        })
    }

    /// Address the relay is bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer.lock().ok().and_then(|peer| *peer)
    }

    fn set_last_peer(&self, addr: SocketAddr) {
        if let Ok(mut peer) = self.last_peer.lock() {
            if *peer != Some(addr) {
                tracing::debug!("UDP relay now answering {}", addr);
                *peer = Some(addr);
            }
        }
    }

    /// Relay until the session closes
    ///
    /// # Errors
    ///
    /// Returns an error if the UDP socket fails.
    pub async fn run(&self, conn: Arc<dyn PacketConn>) -> anyhow::Result<()> {
        let conn = conn.as_ref();
        // Either direction finishing means the session or the socket is done.
        tokio::select! {
            result = self.upstream(conn) => result,
            result = self.downstream(conn) => result,
        }
    }

    async fn upstream(&self, conn: &dyn PacketConn) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            self.set_last_peer(from);
            match conn.enqueue(buf[..len].to_vec()).await {
                Ok(()) => {}
                Err(e) if e.is_closed() => return Ok(()),
                Err(e) => tracing::warn!("Dropping {} byte datagram: {}", len, e),
            }
        }
    }

    async fn downstream(&self, conn: &dyn PacketConn) -> anyhow::Result<()> {
        loop {
            let payload = match conn.dequeue().await {
                Ok(payload) => payload,
                Err(e) if e.is_closed() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match self.last_peer() {
                Some(peer) => {
                    self.socket.send_to(&payload, peer).await?;
                }
                None => tracing::debug!(
                    "Dropping {} byte payload, no local UDP peer yet",
                    payload.len()
                ),
            }
        }
    }
}
