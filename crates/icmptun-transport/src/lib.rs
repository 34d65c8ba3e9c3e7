//! # icmptun Transport
//!
//! ICMP transport layer for the icmptun tunnel.
//!
//! This crate provides:
//! - ICMP Echo envelope encoding, parsing and checksums
//! - Raw ICMPv4 sockets driven by Tokio
//! - An in-process memory network for tests and loopback setups

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod icmp;
pub mod memory;
pub mod raw;
pub mod transport;

pub use icmp::{EchoKind, EchoPacket, IcmpError};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use raw::RawIcmpTransport;
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
