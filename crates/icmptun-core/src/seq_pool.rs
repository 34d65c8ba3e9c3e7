//! Lock-free sequence pool for the server side of the tunnel.
//!
//! The server may only answer with echo sequence numbers the client has
//! actually sent, so every inbound request's sequence is parked here and the
//! writer spends them oldest first. When the writer falls behind, the oldest
//! unread sequence is overwritten.
//!
//! # Design
//!
//! - **Packed cursor**: `{read_start, read_count, write_cursor, in_flight}`
//!   lives in one `AtomicU64` and is only ever replaced whole by CAS
//! - **Two-phase push**: reserve a slot (evicting when full), store, publish
//! - **Async pop**: consumers park on a `Notify` that every push signals

use crate::error::ConfigError;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Largest supported pool capacity (write cursor is 15 bits)
pub const MAX_POOL_CAPACITY: usize = 1 << 15;

const READ_COUNT_SHIFT: u32 = 32;
const WRITE_CURSOR_SHIFT: u32 = 48;
const WRITE_CURSOR_MASK: u64 = 0x7FFF;
const IN_FLIGHT_BIT: u64 = 1 << 63;

/// Unpacked view of the pool cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    /// Free-running index of the oldest unread entry
    read_start: u32,
    /// Published, unread entries
    read_count: u16,
    /// Slot reserved by the in-flight push
    write_cursor: u16,
    /// A push has reserved a slot but not yet published it
    in_flight: bool,
}

impl Cursor {
    fn unpack(raw: u64) -> Self {
        Self {
            read_start: raw as u32,
            read_count: (raw >> READ_COUNT_SHIFT) as u16,
            write_cursor: ((raw >> WRITE_CURSOR_SHIFT) & WRITE_CURSOR_MASK) as u16,
            in_flight: raw & IN_FLIGHT_BIT != 0,
        }
    }

    fn pack(self) -> u64 {
        let mut raw = u64::from(self.read_start)
            | u64::from(self.read_count) << READ_COUNT_SHIFT
            | (u64::from(self.write_cursor) & WRITE_CURSOR_MASK) << WRITE_CURSOR_SHIFT;
        if self.in_flight {
            raw |= IN_FLIGHT_BIT;
        }
        raw
    }
}

/// Bounded FIFO-with-overwrite of 16-bit echo sequence numbers
///
/// Intended for one producer (the server reader) and one consumer (the
/// server writer). Pushing never blocks; popping waits for a value.
///
/// # Example
///
/// ```
/// use icmptun_core::seq_pool::SequencePool;
///
/// let pool = SequencePool::new(4).unwrap();
/// for seq in 0..6 {
///     pool.push(seq);
/// }
///
/// // Two oldest were overwritten
/// assert_eq!(pool.try_pop(), Some(2));
/// assert_eq!(pool.len(), 3);
/// ```
pub struct SequencePool {
    slots: Box<[AtomicU16]>,
    mask: usize,
    cursor: AtomicU64,
    evictions: AtomicU64,
    notify: Notify,
}

impl SequencePool {
    /// Create a pool holding up to `capacity` sequences
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPoolCapacity` unless `capacity` is a
    /// power of two no larger than 32768.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if !capacity.is_power_of_two() || capacity > MAX_POOL_CAPACITY {
            return Err(ConfigError::InvalidPoolCapacity(capacity));
        }

        let slots = (0..capacity)
            .map(|_| AtomicU16::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity - 1,
            cursor: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Append a sequence, overwriting the oldest unread one when full
    pub fn push(&self, seq: u16) {
        let slot = self.reserve();

        self.slots[slot].store(seq, Ordering::Release);

        // Publish: make the reserved slot visible to the consumer
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let mut next = Cursor::unpack(current);
            next.read_count += 1;
            next.in_flight = false;

            match self.cursor.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.notify.notify_one();
    }

    /// Claim the slot after the newest published entry
    fn reserve(&self) -> usize {
        let capacity = self.capacity();
        let mut current = self.cursor.load(Ordering::Acquire);

        loop {
            let cursor = Cursor::unpack(current);
            if cursor.in_flight {
                // Another push has not published yet
                std::hint::spin_loop();
                current = self.cursor.load(Ordering::Acquire);
                continue;
            }

            let mut next = cursor;
            let full = usize::from(cursor.read_count) == capacity;
            if full {
                next.read_start = cursor.read_start.wrapping_add(1);
                next.read_count -= 1;
            }
            let slot =
                (cursor.read_start as usize).wrapping_add(usize::from(cursor.read_count)) & self.mask;
            next.write_cursor = slot as u16;
            next.in_flight = true;

            match self.cursor.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if full {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    return slot;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Take the oldest unread sequence, if any
    pub fn try_pop(&self) -> Option<u16> {
        let mut current = self.cursor.load(Ordering::Acquire);

        loop {
            let cursor = Cursor::unpack(current);
            if cursor.read_count == 0 {
                return None;
            }

            // Read before claiming; the CAS fails if a push evicted this
            // slot in the meantime.
            let slot = cursor.read_start as usize & self.mask;
            let seq = self.slots[slot].load(Ordering::Acquire);

            let next = Cursor {
                read_start: cursor.read_start.wrapping_add(1),
                read_count: cursor.read_count - 1,
                ..cursor
            };

            match self.cursor.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(seq),
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait for and take the oldest unread sequence
    ///
    /// Cancel-safe: dropping the future never loses a value.
    pub async fn pop(&self) -> u16 {
        loop {
            if let Some(seq) = self.try_pop() {
                return seq;
            }
            self.notify.notified().await;
        }
    }

    /// Number of unread sequences (approximate, may change concurrently)
    pub fn len(&self) -> usize {
        usize::from(Cursor::unpack(self.cursor.load(Ordering::Acquire)).read_count)
    }

    /// Check if the pool holds no unread sequences
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get pool capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sequences overwritten before they were read
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SequencePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencePool")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("evictions", &self.evictions())
            .finish()
    }
}
