//! In-process ICMP transport.
//!
//! A `MemoryNetwork` routes whole ICMP messages between attached
//! `MemoryTransport`s by address. No privileges are needed, which makes it
//! the backend for session tests and for running both tunnel ends inside
//! one process. Messages to an address nobody is attached to, or to an
//! endpoint whose receive queue is full, are dropped as they would be on a
//! real network.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

type Datagram = (Vec<u8>, IpAddr);

/// Default number of datagrams an endpoint queues before dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Shared routing table for memory transports
#[derive(Clone)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<HashMap<IpAddr, mpsc::Sender<Datagram>>>>,
    queue_capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty network whose endpoints queue at most `capacity`
    /// undelivered datagrams each
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            queue_capacity: capacity.max(1),
        }
    }

    /// Attach a new endpoint at `addr`.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if another live endpoint already
    /// holds `addr`.
    pub fn attach(&self, addr: impl Into<IpAddr>) -> TransportResult<MemoryTransport> {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        {
            let mut routes = self
                .routes
                .lock()
                .map_err(|_| TransportError::BindFailed("memory network poisoned".into()))?;
            if routes.get(&addr).is_some_and(|existing| !existing.is_closed()) {
                return Err(TransportError::BindFailed(format!(
                    "{addr} already attached"
                )));
            }
            routes.insert(addr, tx);
        }

        let (closed, _) = watch::channel(false);
        Ok(MemoryTransport {
            network: self.clone(),
            local: addr,
            inbound: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: Arc::new(closed),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Create two endpoints attached to a fresh private network
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if `a` and `b` are equal.
    pub fn pair(a: Ipv4Addr, b: Ipv4Addr) -> TransportResult<(MemoryTransport, MemoryTransport)> {
        let network = Self::new();
        let first = network.attach(a)?;
        let second = network.attach(b)?;
        Ok((first, second))
    }

    fn route(&self, to: IpAddr) -> Option<mpsc::Sender<Datagram>> {
        self.routes.lock().ok()?.get(&to).cloned()
    }

    fn detach(&self, addr: IpAddr) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&addr);
        }
    }
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

/// One endpoint on a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: IpAddr,
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Datagram>>>,
    closed: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl MemoryTransport {
    /// Shorthand for [`MemoryNetwork::pair`]
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if `a` and `b` are equal.
    pub fn pair(a: Ipv4Addr, b: Ipv4Addr) -> TransportResult<(Self, Self)> {
        MemoryNetwork::pair(a, b)
    }

    /// The network this endpoint is attached to
    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: IpAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match self.network.route(addr) {
            Some(peer) => {
                if let Err(e) = peer.try_send((buf.to_vec(), self.local)) {
                    tracing::trace!(
                        "Memory endpoint {} not receiving ({}), dropping {} bytes",
                        addr,
                        e,
                        buf.len()
                    );
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                tracing::trace!("No memory endpoint at {}, dropping {} bytes", addr, buf.len());
            }
        }

        self.counters
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, IpAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        let (data, from) = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
            datagram = inbound.recv() => datagram.ok_or(TransportError::Closed)?,
        };

        // Oversized datagrams are truncated like a real datagram socket
        let size = data.len().min(buf.len());
        buf[..size].copy_from_slice(&data[..size]);

        self.counters
            .bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok((size, from))
    }

    fn local_addr(&self) -> TransportResult<IpAddr> {
        Ok(self.local)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.send_replace(true) {
            self.network.detach(self.local);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: 0,
            recv_errors: 0,
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
        }
    }
}
