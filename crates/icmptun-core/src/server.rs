//! Server side of the tunnel.
//!
//! The server never originates ICMP traffic. It binds to the first client
//! whose echo request passes the peer filter, remembers every request
//! sequence in a [`SequencePool`], and answers each outbound payload with an
//! Echo Reply reusing the oldest unanswered sequence.
//!
//! The host kernel answers echo requests by itself, which duplicates every
//! request back to the client. Disable that on the server host with
//! `sysctl -w net.ipv4.icmp_echo_ignore_all=1`.

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::frame::{Frame, FrameFlags};
use crate::seq_pool::SequencePool;
use crate::session::{
    PacketConn, Received, SessionCounters, SessionQueues, SessionStats, Shutdown, TaskQueues,
    recv_bounded,
};
use async_trait::async_trait;
use icmptun_transport::{EchoKind, EchoPacket, RawIcmpTransport, Transport, TransportError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Server session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Waiting for the first qualifying echo request
    AwaitingPeer,
    /// Bound to exactly one peer for the rest of the session
    Bound,
    /// Terminal
    Closed,
}

/// The client a server session is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundPeer {
    /// Session token from the peer's first request
    pub identify: u16,
    /// Peer address
    pub addr: Ipv4Addr,
}

/// Handed from reader to writer when the session binds
struct Binding {
    peer: BoundPeer,
    pool: Arc<SequencePool>,
}

struct ServerShared {
    transport: Arc<dyn Transport>,
    filter: Ipv4Addr,
    shutdown: Shutdown,
    counters: SessionCounters,
    peer: OnceLock<BoundPeer>,
}

impl ServerShared {
    async fn fail(&self, task: &str, error: &TransportError) {
        if self.shutdown.trigger() {
            tracing::error!("Server session: {} failed: {}", task, error);
        }
        self.close_transport().await;
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
    }

    /// Whether a request from `from` may bind an unbound session
    fn qualifies(&self, identify: u16, from: Ipv4Addr) -> bool {
        identify != 0 && (self.filter.is_unspecified() || self.filter == from)
    }
}

/// Server end of an ICMP tunnel
///
/// # Examples
///
/// ```no_run
/// use icmptun_core::{ServerConfig, ServerSession};
/// use std::net::Ipv4Addr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Accept whichever client speaks first
/// let session = ServerSession::listen(
///     Ipv4Addr::UNSPECIFIED,
///     Ipv4Addr::UNSPECIFIED,
///     ServerConfig::default(),
/// )?;
///
/// let request = session.dequeue().await?;
/// session.enqueue(request).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerSession {
    shared: Arc<ServerShared>,
    queues: SessionQueues,
}

impl ServerSession {
    /// Open a raw ICMP socket on `local` and wait for a peer matching
    /// `remote` (`0.0.0.0` accepts the first sender).
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `SessionError::Config` for invalid settings (checked before the
    /// socket is opened), `SessionError::Transport` if the socket cannot be
    /// opened.
    pub fn listen(
        local: Ipv4Addr,
        remote: Ipv4Addr,
        config: ServerConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let transport = RawIcmpTransport::bind(local)?;
        Self::accept_on(Arc::new(transport), remote, config)
    }

    /// Wait for a peer matching `remote` over an existing transport.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `SessionError::Config` for invalid settings.
    pub fn accept_on(
        transport: Arc<dyn Transport>,
        remote: Ipv4Addr,
        config: ServerConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let (queues, tasks) = SessionQueues::new(config.queue_capacity, shutdown.clone());
        let TaskQueues { outbound, inbound } = tasks;
        let (gate_tx, gate_rx) = oneshot::channel();

        let shared = Arc::new(ServerShared {
            transport,
            filter: remote,
            shutdown,
            counters: SessionCounters::default(),
            peer: OnceLock::new(),
        });

        tokio::spawn(run_reader(shared.clone(), inbound, gate_tx, config.clone()));
        tokio::spawn(run_writer(shared.clone(), outbound, gate_rx));

        if remote.is_unspecified() {
            tracing::info!("Server session waiting for any peer");
        } else {
            tracing::info!("Server session waiting for peer {}", remote);
        }

        Ok(Self { shared, queues })
    }

    /// Queue a payload for the bound peer.
    ///
    /// Payloads queued before a peer binds are held until it does. Each
    /// payload is sent only once the peer has supplied a request sequence
    /// to answer.
    ///
    /// # Errors
    /// See [`PacketConn::enqueue`].
    pub async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.queues.enqueue(payload).await
    }

    /// Wait for the next payload from the peer
    ///
    /// # Errors
    /// See [`PacketConn::dequeue`].
    pub async fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        self.queues.dequeue().await
    }

    /// Shut the session down and close the transport. Idempotent.
    pub async fn close(&self) {
        if self.shared.shutdown.trigger() {
            tracing::info!("Server session closed");
        }
        self.shared.close_transport().await;
    }

    /// Resolve once the session has shut down for any reason
    pub async fn closed(&self) {
        self.shared.shutdown.wait().await;
    }

    /// Check if the session has shut down
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_triggered()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        if self.is_closed() {
            ServerState::Closed
        } else if self.shared.peer.get().is_some() {
            ServerState::Bound
        } else {
            ServerState::AwaitingPeer
        }
    }

    /// The bound peer, once a qualifying request has arrived
    pub fn peer(&self) -> Option<BoundPeer> {
        self.shared.peer.get().copied()
    }

    /// Session token of the bound peer
    pub fn identify(&self) -> Option<u16> {
        self.peer().map(|peer| peer.identify)
    }

    /// Snapshot of session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            peer: self.peer(),
            ..self.shared.counters.snapshot()
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.shared.shutdown.trigger();
    }
}

#[async_trait]
impl PacketConn for ServerSession {
    async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        ServerSession::enqueue(self, payload).await
    }

    async fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        ServerSession::dequeue(self).await
    }

    async fn close(&self) {
        ServerSession::close(self).await;
    }

    fn is_closed(&self) -> bool {
        ServerSession::is_closed(self)
    }

    fn stats(&self) -> SessionStats {
        ServerSession::stats(self)
    }
}

async fn run_reader(
    shared: Arc<ServerShared>,
    inbound: mpsc::Sender<Vec<u8>>,
    gate: oneshot::Sender<Binding>,
    config: ServerConfig,
) {
    let read_deadline: Duration = config.read_deadline;
    let mut buf = vec![0u8; config.recv_buffer_size];
    let mut gate = Some(gate);
    let mut binding: Option<(BoundPeer, Arc<SequencePool>)> = None;

    loop {
        let (size, from) = match recv_bounded(
            shared.transport.as_ref(),
            &mut buf,
            read_deadline,
            &shared.shutdown,
        )
        .await
        {
            Ok(Received::Datagram(size, from)) => (size, from),
            Ok(Received::Idle) => continue,
            Ok(Received::Shutdown) => break,
            Err(e) => {
                shared.fail("reader", &e).await;
                return;
            }
        };
        shared.counters.record_received();

        let from = match from {
            IpAddr::V4(addr) => addr,
            IpAddr::V6(addr) => {
                let error = TransportError::UnexpectedAddress(addr.to_string());
                shared.fail("reader", &error).await;
                return;
            }
        };

        let packet = match EchoPacket::parse(&buf[..size]) {
            Ok(packet) if packet.kind == EchoKind::Request => packet,
            Ok(_) => {
                shared.counters.record_discarded();
                continue;
            }
            Err(e) => {
                tracing::debug!("Discarding datagram from {}: {}", from, e);
                shared.counters.record_discarded();
                continue;
            }
        };
        let frame = match Frame::parse(packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Discarding malformed frame from {}: {}", from, e);
                shared.counters.record_discarded();
                continue;
            }
        };

        let pool = match binding.as_ref() {
            Some((peer, pool)) => {
                if peer.addr != from || peer.identify != packet.identifier {
                    tracing::trace!(
                        "Ignoring request {:#06x} from {} while bound",
                        packet.identifier,
                        from
                    );
                    shared.counters.record_discarded();
                    continue;
                }
                pool.clone()
            }
            None => {
                if !shared.qualifies(packet.identifier, from) {
                    shared.counters.record_discarded();
                    continue;
                }

                let pool = match SequencePool::new(config.seq_pool_capacity) {
                    Ok(pool) => Arc::new(pool),
                    Err(e) => {
                        tracing::error!("Server session: cannot allocate sequence pool: {}", e);
                        shared.shutdown.trigger();
                        break;
                    }
                };
                let peer = BoundPeer {
                    identify: packet.identifier,
                    addr: from,
                };
                let _ = shared.peer.set(peer);
                if let Some(gate) = gate.take() {
                    let _ = gate.send(Binding {
                        peer,
                        pool: pool.clone(),
                    });
                }
                tracing::info!(
                    "Server session bound to {} (identify {:#06x})",
                    from,
                    packet.identifier
                );
                binding = Some((peer, pool.clone()));
                pool
            }
        };

        pool.push(packet.sequence);

        if frame.is_keepalive() {
            continue;
        }
        let payload = frame.payload().to_vec();

        tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            sent = inbound.send(payload) => {
                if sent.is_err() {
                    break;
                }
                shared.counters.record_delivered();
            }
        }
    }

    shared.close_transport().await;
    tracing::debug!("Server session: reader stopped");
}

async fn run_writer(
    shared: Arc<ServerShared>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    gate: oneshot::Receiver<Binding>,
) {
    let Binding { peer, pool } = tokio::select! {
        biased;
        _ = shared.shutdown.wait() => return,
        binding = gate => match binding {
            Ok(binding) => binding,
            Err(_) => return,
        },
    };

    let mut frame_buf = Vec::new();
    let mut packet_buf = Vec::new();
    let to = IpAddr::V4(peer.addr);

    loop {
        let payload = tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let seq = tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            seq = pool.pop() => seq,
        };

        if let Err(e) = Frame::new(FrameFlags::new(), &payload).encode_into(&mut frame_buf) {
            tracing::warn!("Dropping outbound payload: {}", e);
            continue;
        }
        EchoPacket::reply(peer.identify, seq, &frame_buf).encode_into(&mut packet_buf);

        if let Err(e) = shared.transport.send_to(&packet_buf, to).await {
            shared.fail("writer", &e).await;
            return;
        }
        shared.counters.record_sent(false);
    }

    tracing::debug!("Server session: writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::frame::decode;
    use icmptun_transport::{MemoryNetwork, MemoryTransport};
    use tokio::time::timeout;

    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const OTHER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

    fn fast_config() -> ServerConfig {
        ServerConfig {
            read_deadline: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn send_request(from: &MemoryTransport, identify: u16, seq: u16, frame: Frame<'_>) {
        let data = frame.encode().unwrap();
        let request = EchoPacket::request(identify, seq, &data).encode();
        from.send_to(&request, IpAddr::V4(SERVER)).await.unwrap();
    }

    async fn recv_reply(at: &MemoryTransport) -> (u16, u16, Vec<u8>) {
        let mut buf = vec![0u8; 2048];
        let (size, from) = timeout(Duration::from_secs(1), at.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(from, IpAddr::V4(SERVER));
        let packet = EchoPacket::parse(&buf[..size]).unwrap();
        assert_eq!(packet.kind, EchoKind::Reply);
        let payload = decode(packet.data).unwrap().payload().to_vec();
        (packet.identifier, packet.sequence, payload)
    }

    async fn wait_for_state(session: &ServerSession, state: ServerState) {
        timeout(Duration::from_secs(1), async {
            while session.state() != state {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn test_server_binds_first_peer_and_replies() {
        let (server_side, client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let session =
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, fast_config())
                .unwrap();
        assert_eq!(session.state(), ServerState::AwaitingPeer);
        assert_eq!(session.stats().peer, None);

        send_request(&client_side, 0x0101, 77, Frame::new(FrameFlags::new(), b"hi")).await;

        let payload = timeout(Duration::from_secs(1), session.dequeue())
            .await
            .expect("no payload")
            .unwrap();
        assert_eq!(payload, b"hi");
        assert_eq!(session.state(), ServerState::Bound);
        assert_eq!(
            session.peer(),
            Some(BoundPeer {
                identify: 0x0101,
                addr: CLIENT
            })
        );
        assert_eq!(session.stats().peer, session.peer());
        assert_eq!(session.stats().air_sequence, None);

        session.enqueue(b"there".to_vec()).await.unwrap();
        let (identify, seq, payload) = recv_reply(&client_side).await;
        assert_eq!(identify, 0x0101);
        assert_eq!(seq, 77);
        assert_eq!(payload, b"there");

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_replies_use_oldest_sequences() {
        let (server_side, client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let session =
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, fast_config())
                .unwrap();

        for seq in 1..=3u16 {
            send_request(&client_side, 9, seq, Frame::keepalive()).await;
        }
        wait_for_state(&session, ServerState::Bound).await;
        // Let the reader push all three sequences
        tokio::time::sleep(Duration::from_millis(20)).await;

        for expected in 1..=3u16 {
            session.enqueue(vec![expected as u8]).await.unwrap();
            let (_, seq, payload) = recv_reply(&client_side).await;
            assert_eq!(seq, expected);
            assert_eq!(payload, vec![expected as u8]);
        }

        // Keepalives were never delivered
        assert_eq!(session.stats().payloads_delivered, 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_server_waits_for_sequence_before_replying() {
        let (server_side, client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let session =
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, fast_config())
                .unwrap();

        // Queued before any peer exists
        session.enqueue(b"early".to_vec()).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(50), client_side.recv_from(&mut buf))
                .await
                .is_err()
        );

        send_request(&client_side, 5, 500, Frame::keepalive()).await;
        let (identify, seq, payload) = recv_reply(&client_side).await;
        assert_eq!((identify, seq), (5, 500));
        assert_eq!(payload, b"early");

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_filter_and_zero_identify() {
        let network = MemoryNetwork::new();
        let server_side = network.attach(SERVER).unwrap();
        let client_side = network.attach(CLIENT).unwrap();
        let other = network.attach(OTHER).unwrap();

        let session =
            ServerSession::accept_on(Arc::new(server_side), CLIENT, fast_config()).unwrap();

        // Wrong source, then identifier zero: neither binds
        send_request(&other, 7, 1, Frame::new(FrameFlags::new(), b"no")).await;
        send_request(&client_side, 0, 2, Frame::new(FrameFlags::new(), b"no")).await;
        send_request(&client_side, 7, 3, Frame::new(FrameFlags::new(), b"yes")).await;

        let payload = timeout(Duration::from_secs(1), session.dequeue())
            .await
            .expect("no payload")
            .unwrap();
        assert_eq!(payload, b"yes");
        assert_eq!(session.peer().map(|peer| peer.addr), Some(CLIENT));
        assert_eq!(session.stats().discarded, 2);

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_ignores_others_once_bound() {
        let network = MemoryNetwork::new();
        let server_side = network.attach(SERVER).unwrap();
        let client_side = network.attach(CLIENT).unwrap();
        let other = network.attach(OTHER).unwrap();

        let session =
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, fast_config())
                .unwrap();

        send_request(&client_side, 7, 1, Frame::new(FrameFlags::new(), b"first")).await;
        assert_eq!(session.dequeue().await.unwrap(), b"first");

        send_request(&other, 7, 2, Frame::new(FrameFlags::new(), b"intruder")).await;
        send_request(&client_side, 8, 3, Frame::new(FrameFlags::new(), b"new id")).await;
        send_request(&client_side, 7, 4, Frame::new(FrameFlags::new(), b"second")).await;

        assert_eq!(session.dequeue().await.unwrap(), b"second");
        assert_eq!(session.identify(), Some(7));

        // Only sequences 1 and 4 were pooled
        session.enqueue(b"a".to_vec()).await.unwrap();
        session.enqueue(b"b".to_vec()).await.unwrap();
        assert_eq!(recv_reply(&client_side).await.1, 1);
        assert_eq!(recv_reply(&client_side).await.1, 4);

        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(30), other.recv_from(&mut buf))
                .await
                .is_err()
        );

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_discards_replies_and_garbage() {
        let (server_side, client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let session =
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, fast_config())
                .unwrap();

        let frame = Frame::new(FrameFlags::new(), b"x").encode().unwrap();
        let reply = EchoPacket::reply(3, 1, &frame).encode();
        client_side.send_to(&reply, IpAddr::V4(SERVER)).await.unwrap();
        client_side.send_to(b"junk", IpAddr::V4(SERVER)).await.unwrap();
        let bad_frame = EchoPacket::request(3, 2, &[0, 0, 7]).encode();
        client_side.send_to(&bad_frame, IpAddr::V4(SERVER)).await.unwrap();

        send_request(&client_side, 3, 3, Frame::new(FrameFlags::new(), b"ok")).await;
        assert_eq!(session.dequeue().await.unwrap(), b"ok");
        assert_eq!(session.stats().discarded, 3);

        session.close().await;
    }

    #[tokio::test]
    async fn test_server_close_unblocks_and_is_terminal() {
        let (server_side, _client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let config = ServerConfig {
            read_deadline: Duration::from_secs(30),
            ..Default::default()
        };
        let session = Arc::new(
            ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, config)
                .unwrap(),
        );

        let reader = session.clone();
        let handle = tokio::spawn(async move { reader.dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close().await;
        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("dequeue not unblocked")
            .unwrap();
        assert!(result.unwrap_err().is_closed());
        assert_eq!(session.state(), ServerState::Closed);
        assert!(session.enqueue(b"x".to_vec()).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_pool_capacity() {
        let (server_side, _client_side) = MemoryTransport::pair(SERVER, CLIENT).unwrap();
        let config = ServerConfig {
            seq_pool_capacity: 10,
            ..Default::default()
        };
        let err = ServerSession::accept_on(Arc::new(server_side), Ipv4Addr::UNSPECIFIED, config)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Config(ConfigError::InvalidPoolCapacity(10))
        ));
    }
}
