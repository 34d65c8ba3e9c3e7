//! Client side of the tunnel.
//!
//! A client sends every payload as an ICMP Echo Request to the server and
//! receives the server's traffic as Echo Replies. Because the server can
//! only reply to requests it has seen, the client also keeps a paced stream
//! of empty keepalive requests in flight, sized by the booster.
//!
//! Three tasks run per session:
//! - **reader**: validates replies, feeds the booster, delivers payloads
//! - **writer**: sends payloads and keepalives, paced
//! - **booster**: recomputes the air sequence count every boost period

use crate::booster::AirSequenceController;
use crate::config::ClientConfig;
use crate::error::{ConfigError, SessionError};
use crate::frame::{Frame, FrameFlags};
use crate::sequence::{HighWaterMark, SequenceCounter};
use crate::session::{
    PacketConn, Received, SendPacer, SessionCounters, SessionQueues, SessionStats, Shutdown,
    TaskQueues, random_identify, recv_bounded,
};
use crate::timer::KeepaliveTimer;
use async_trait::async_trait;
use icmptun_transport::{EchoKind, EchoPacket, RawIcmpTransport, Transport, TransportError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

/// State shared between the session handle and its tasks
struct ClientShared {
    transport: Arc<dyn Transport>,
    remote: Ipv4Addr,
    identify: u16,
    boost_period: Duration,
    shutdown: Shutdown,
    counters: SessionCounters,
    local_seq: SequenceCounter,
    peer_seq: HighWaterMark,
    replies: AtomicU64,
    air_seq: AtomicU32,
    rearm: Notify,
}

impl ClientShared {
    fn keepalive_period(&self) -> Duration {
        self.boost_period / self.air_seq.load(Ordering::Acquire).max(1)
    }

    /// Shut down after a fatal error in one of the tasks
    async fn fail(&self, task: &str, error: &TransportError) {
        if self.shutdown.trigger() {
            tracing::error!(
                "Client session {:#06x}: {} failed: {}",
                self.identify,
                task,
                error
            );
        }
        self.close_transport().await;
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
    }
}

/// Client end of an ICMP tunnel
///
/// # Examples
///
/// ```no_run
/// use icmptun_core::{ClientConfig, ClientSession};
/// use std::net::Ipv4Addr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = ClientSession::dial(
///     Ipv4Addr::UNSPECIFIED,
///     Ipv4Addr::new(203, 0, 113, 7),
///     ClientConfig::default(),
/// )?;
///
/// session.enqueue(b"hello".to_vec()).await?;
/// let reply = session.dequeue().await?;
/// println!("{} bytes back", reply.len());
/// # Ok(())
/// # }
/// ```
pub struct ClientSession {
    shared: Arc<ClientShared>,
    queues: SessionQueues,
}

impl ClientSession {
    /// Open a raw ICMP socket on `local` and start a session to `remote`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `SessionError::Config` for invalid settings (checked before the
    /// socket is opened), `SessionError::Transport` if the socket cannot be
    /// opened.
    pub fn dial(
        local: Ipv4Addr,
        remote: Ipv4Addr,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        validate(remote, &config)?;
        let transport = RawIcmpTransport::bind(local)?;
        Self::connect(Arc::new(transport), remote, config)
    }

    /// Start a session to `remote` over an existing transport.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `SessionError::Config` for invalid settings.
    pub fn connect(
        transport: Arc<dyn Transport>,
        remote: Ipv4Addr,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        validate(remote, &config)?;
        let (min_air, max_air) = config.air_bounds()?;
        let controller = AirSequenceController::new(min_air, max_air);
        let identify = config.identify.unwrap_or_else(random_identify);

        let shutdown = Shutdown::new();
        let (queues, tasks) = SessionQueues::new(config.queue_capacity, shutdown.clone());
        let TaskQueues { outbound, inbound } = tasks;

        let shared = Arc::new(ClientShared {
            transport,
            remote,
            identify,
            boost_period: config.boost_period,
            shutdown,
            counters: SessionCounters::default(),
            local_seq: SequenceCounter::default(),
            peer_seq: HighWaterMark::default(),
            replies: AtomicU64::new(0),
            air_seq: AtomicU32::new(controller.current()),
            rearm: Notify::new(),
        });

        tokio::spawn(run_reader(
            shared.clone(),
            inbound,
            config.read_deadline,
            config.recv_buffer_size,
        ));
        tokio::spawn(run_writer(shared.clone(), outbound, config.send_interval));
        tokio::spawn(run_booster(shared.clone(), controller));

        tracing::info!(
            "Client session {:#06x} started towards {} (air sequences {}..={})",
            identify,
            remote,
            min_air,
            max_air
        );

        Ok(Self { shared, queues })
    }

    /// Queue a payload for transmission
    ///
    /// # Errors
    /// See [`PacketConn::enqueue`].
    pub async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.queues.enqueue(payload).await
    }

    /// Wait for the next payload from the server
    ///
    /// # Errors
    /// See [`PacketConn::dequeue`].
    pub async fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        self.queues.dequeue().await
    }

    /// Shut the session down and close the transport. Idempotent.
    pub async fn close(&self) {
        if self.shared.shutdown.trigger() {
            tracing::info!("Client session {:#06x} closed", self.shared.identify);
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

    /// Session token carried in the ICMP identifier field
    pub fn identify(&self) -> u16 {
        self.shared.identify
    }

    /// Server address
    pub fn remote(&self) -> Ipv4Addr {
        self.shared.remote
    }

    /// Current air sequence count
    pub fn air_sequence(&self) -> u32 {
        self.shared.air_seq.load(Ordering::Acquire)
    }

    /// Last sequence number sent
    pub fn local_sequence(&self) -> u16 {
        self.shared.local_seq.current()
    }

    /// Newest sequence number seen in a reply
    pub fn peer_sequence(&self) -> u16 {
        self.shared.peer_seq.get()
    }

    /// Snapshot of session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            air_sequence: Some(self.air_sequence()),
            ..self.shared.counters.snapshot()
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // Tasks see the signal and exit; the reader closes the transport
        self.shared.shutdown.trigger();
    }
}

#[async_trait]
impl PacketConn for ClientSession {
    async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        ClientSession::enqueue(self, payload).await
    }

    async fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        ClientSession::dequeue(self).await
    }

    async fn close(&self) {
        ClientSession::close(self).await;
    }

    fn is_closed(&self) -> bool {
        ClientSession::is_closed(self)
    }

    fn stats(&self) -> SessionStats {
        ClientSession::stats(self)
    }
}

fn validate(remote: Ipv4Addr, config: &ClientConfig) -> Result<(), ConfigError> {
    if remote.is_unspecified() || remote.is_broadcast() {
        return Err(ConfigError::InvalidRemote(remote.to_string()));
    }
    config.validate()
}

async fn run_reader(
    shared: Arc<ClientShared>,
    inbound: mpsc::Sender<Vec<u8>>,
    read_deadline: Duration,
    recv_buffer_size: usize,
) {
    let mut buf = vec![0u8; recv_buffer_size];

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
        if from != shared.remote {
            tracing::trace!("Ignoring ICMP from {}", from);
            shared.counters.record_discarded();
            continue;
        }

        let packet = match EchoPacket::parse(&buf[..size]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Discarding datagram from {}: {}", from, e);
                shared.counters.record_discarded();
                continue;
            }
        };
        if packet.kind != EchoKind::Reply || packet.identifier != shared.identify {
            shared.counters.record_discarded();
            continue;
        }

        // Every matching reply counts towards the booster, even if the
        // frame inside turns out to be malformed
        shared.replies.fetch_add(1, Ordering::Relaxed);
        shared.peer_seq.observe(packet.sequence);

        let frame = match Frame::parse(packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Discarding malformed frame from {}: {}", from, e);
                shared.counters.record_discarded();
                continue;
            }
        };
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
    tracing::debug!("Client session {:#06x}: reader stopped", shared.identify);
}

async fn run_writer(
    shared: Arc<ClientShared>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    send_interval: Option<Duration>,
) {
    let mut timer = KeepaliveTimer::new(shared.keepalive_period());
    let mut pacer = SendPacer::new(send_interval);
    let mut frame_buf = Vec::new();
    let mut packet_buf = Vec::new();
    let remote = IpAddr::V4(shared.remote);

    loop {
        let payload = tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            _ = shared.rearm.notified() => {
                timer.set_period(shared.keepalive_period());
                continue;
            }
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    timer.reset();
                    Some(payload)
                }
                None => break,
            },
            _ = timer.tick() => None,
        };

        tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            _ = pacer.wait() => {}
        }

        let frame = match &payload {
            Some(data) => Frame::new(FrameFlags::new(), data),
            None => Frame::keepalive(),
        };
        if let Err(e) = frame.encode_into(&mut frame_buf) {
            tracing::warn!("Dropping outbound payload: {}", e);
            continue;
        }

        let seq = shared.local_seq.next();
        EchoPacket::request(shared.identify, seq, &frame_buf).encode_into(&mut packet_buf);

        if let Err(e) = shared.transport.send_to(&packet_buf, remote).await {
            shared.fail("writer", &e).await;
            return;
        }
        shared.counters.record_sent(payload.is_none());
    }

    tracing::debug!("Client session {:#06x}: writer stopped", shared.identify);
}

async fn run_booster(shared: Arc<ClientShared>, mut controller: AirSequenceController) {
    let period = shared.boost_period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        let replies = shared.replies.swap(0, Ordering::AcqRel);
        let previous = controller.current();
        let air = controller.update(replies);
        shared.air_seq.store(air, Ordering::Release);

        if air != previous {
            tracing::debug!(
                "Client session {:#06x}: {} replies, air sequences {} -> {}",
                shared.identify,
                replies,
                previous,
                air
            );
        }
        shared.rearm.notify_one();
    }

    tracing::debug!("Client session {:#06x}: booster stopped", shared.identify);
}
