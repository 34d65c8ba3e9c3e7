//! # icmptun Core
//!
//! Core tunnel implementation for icmptun, an IP-over-ICMP tunnel.
//!
//! This crate provides:
//! - Frame encoding and decoding (zero-copy parsing)
//! - Client sessions with adaptive keepalive pacing
//! - Single-peer server sessions
//! - A lock-free sequence pool for answering with live sequences
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  ClientSession / ServerSession               │
//! │    (enqueue / dequeue, reader + writer [+ booster] tasks)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                            Frames                            │
//! │          (flags + length + payload inside echo data)         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    ICMP Echo / Echo Reply                    │
//! │        (identifier = session, sequence = echo counter)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod booster;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod seq_pool;
pub mod sequence;
pub mod server;
pub mod session;
pub mod timer;

pub use booster::AirSequenceController;
pub use client::ClientSession;
pub use config::{ClientConfig, ServerConfig};
pub use error::{ConfigError, Error, FrameError, SessionError};
pub use frame::{Frame, FrameFlags};
pub use seq_pool::SequencePool;
pub use server::{BoundPeer, ServerSession, ServerState};
pub use session::{PacketConn, SessionStats};
pub use timer::KeepaliveTimer;

/// Fixed frame header size in bytes (flags + u16 length)
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest payload a session accepts: the frame, the ICMP echo header and
/// an IPv4 header must fit in one 65535-byte IPv4 datagram
pub const MAX_TUNNEL_PAYLOAD: usize = u16::MAX as usize
    - icmptun_transport::icmp::IPV4_MIN_HEADER_SIZE
    - icmptun_transport::icmp::ECHO_HEADER_SIZE
    - FRAME_HEADER_SIZE;
