//! 16-bit echo sequence bookkeeping.
//!
//! Sequence numbers wrap modulo 65536, so "newer" is decided on the circle:
//! a candidate is newer when it lies less than half the space ahead.

use std::sync::atomic::{AtomicU16, Ordering};

/// Half of the 16-bit sequence space
const HALF_SPACE: u16 = 1 << 15;

/// Whether `candidate` is strictly newer than `current` under wrapping order
pub fn is_newer(candidate: u16, current: u16) -> bool {
    let distance = candidate.wrapping_sub(current);
    distance != 0 && distance < HALF_SPACE
}

/// Outgoing sequence counter, advanced once per sent datagram
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU16);

impl SequenceCounter {
    /// Start counting after `initial`
    pub fn new(initial: u16) -> Self {
        Self(AtomicU16::new(initial))
    }

    /// Advance and return the new sequence
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Last sequence handed out
    pub fn current(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }
}

/// Highest sequence observed from the peer
#[derive(Debug, Default)]
pub struct HighWaterMark(AtomicU16);

impl HighWaterMark {
    /// Start at `initial`
    pub fn new(initial: u16) -> Self {
        Self(AtomicU16::new(initial))
    }

    /// Record `candidate`; returns true if it advanced the mark
    pub fn observe(&self, candidate: u16) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                is_newer(candidate, current).then_some(candidate)
            })
            .is_ok()
    }

    /// Current mark
    pub fn get(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }
}
