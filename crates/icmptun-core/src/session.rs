//! Plumbing shared by client and server sessions.
//!
//! Both session kinds run background tasks around one transport and expose
//! the same boundary to collaborators: `enqueue` a payload for sending and
//! `dequeue` the next delivered payload. Everything here is independent of
//! which side of the tunnel is running.

use crate::error::SessionError;
use crate::server::BoundPeer;
use crate::MAX_TUNNEL_PAYLOAD;
use async_trait::async_trait;
use icmptun_transport::{Transport, TransportError, TransportResult};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

/// Packet boundary implemented by both session kinds
///
/// Lets a collaborator (a TUN pump, a UDP relay, a test harness) be written
/// once for either end of the tunnel.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Queue a payload for transmission, waiting while the queue is full.
    ///
    /// # Errors
    /// `SessionError::Closed` once the session is terminal,
    /// `SessionError::PayloadTooLarge` for payloads over
    /// [`MAX_TUNNEL_PAYLOAD`](crate::MAX_TUNNEL_PAYLOAD) bytes.
    async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError>;

    /// Wait for the next delivered payload.
    ///
    /// # Errors
    /// `SessionError::Closed` once the session is terminal.
    async fn dequeue(&self) -> Result<Vec<u8>, SessionError>;

    /// Shut the session down. Idempotent.
    async fn close(&self);

    /// Check if the session has shut down
    fn is_closed(&self) -> bool;

    /// Snapshot of session counters
    fn stats(&self) -> SessionStats;
}

/// One-way cancellation signal observed by every session task
#[derive(Debug, Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; returns true for the call that actually fired it
    pub(crate) fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has fired
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Live session counters
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    keepalives_sent: AtomicU64,
    payloads_delivered: AtomicU64,
    discarded: AtomicU64,
}

impl SessionCounters {
    pub(crate) fn record_sent(&self, keepalive: bool) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        if keepalive {
            self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.payloads_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            payloads_delivered: self.payloads_delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            air_sequence: None,
            peer: None,
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// ICMP datagrams written to the transport
    pub datagrams_sent: u64,
    /// ICMP datagrams read from the transport
    pub datagrams_received: u64,
    /// Keepalive frames sent (client only)
    pub keepalives_sent: u64,
    /// Payloads handed to the inbound queue
    pub payloads_delivered: u64,
    /// Datagrams dropped by validation or peer filtering
    pub discarded: u64,
    /// Current air sequence count (client only)
    pub air_sequence: Option<u32>,
    /// Bound peer (server only, once bound)
    pub peer: Option<BoundPeer>,
}

/// Collaborator-facing ends of the session queues
pub(crate) struct SessionQueues {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: Shutdown,
}

/// Task-facing ends of the session queues
pub(crate) struct TaskQueues {
    pub(crate) outbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) inbound: mpsc::Sender<Vec<u8>>,
}

impl SessionQueues {
    pub(crate) fn new(capacity: usize, shutdown: Shutdown) -> (Self, TaskQueues) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: outbound_tx,
                inbound: Mutex::new(inbound_rx),
                shutdown,
            },
            TaskQueues {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    pub(crate) async fn enqueue(&self, payload: Vec<u8>) -> Result<(), SessionError> {
        if self.shutdown.is_triggered() {
            return Err(SessionError::Closed);
        }
        if payload.len() > MAX_TUNNEL_PAYLOAD {
            return Err(SessionError::PayloadTooLarge(payload.len()));
        }

        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(SessionError::Closed),
            sent = self.outbound.send(payload) => sent.map_err(|_| SessionError::Closed),
        }
    }

    pub(crate) async fn dequeue(&self) -> Result<Vec<u8>, SessionError> {
        let mut inbound = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Err(SessionError::Closed),
            guard = self.inbound.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(SessionError::Closed),
            payload = inbound.recv() => payload.ok_or(SessionError::Closed),
        }
    }
}

/// Result of one bounded receive
pub(crate) enum Received {
    /// A datagram of this many bytes from this address
    Datagram(usize, IpAddr),
    /// Deadline passed with nothing to read
    Idle,
    /// Session is shutting down
    Shutdown,
}

/// Receive one datagram, giving up at `deadline` so the caller can
/// re-check for shutdown.
///
/// # Errors
/// Any transport error other than a timeout is returned as-is.
pub(crate) async fn recv_bounded(
    transport: &dyn Transport,
    buf: &mut [u8],
    deadline: Duration,
    shutdown: &Shutdown,
) -> TransportResult<Received> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => Ok(Received::Shutdown),
        received = tokio::time::timeout(deadline, transport.recv_from(buf)) => match received {
            Err(_) => Ok(Received::Idle),
            Ok(Ok((size, from))) => Ok(Received::Datagram(size, from)),
            Ok(Err(e)) if e.is_timeout() => Ok(Received::Idle),
            Ok(Err(TransportError::Closed)) if shutdown.is_triggered() => Ok(Received::Shutdown),
            Ok(Err(e)) => Err(e),
        },
    }
}

/// Minimum spacing between sends, with a burst of one
#[derive(Debug)]
pub(crate) struct SendPacer {
    interval: Option<Duration>,
    next_slot: Option<Instant>,
}

impl SendPacer {
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.filter(|interval| !interval.is_zero()),
            next_slot: None,
        }
    }

    /// Wait for the next send slot and claim it
    pub(crate) async fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        let slot = match self.next_slot {
            Some(slot) if slot > now => {
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        self.next_slot = Some(slot + interval);
    }
}

/// Random nonzero session token
pub(crate) fn random_identify() -> u16 {
    rand::thread_rng().gen_range(1..=u16::MAX)
}
