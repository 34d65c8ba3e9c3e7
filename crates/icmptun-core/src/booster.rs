//! Adaptive keepalive pacing ("booster").
//!
//! The server can only answer with sequences the client has sent, so the
//! client keeps a number of echo requests "in the air". Every boost period
//! the reply count observed since the last tick is turned into a new air
//! sequence count:
//!
//! ```text
//! implied = replies / REPLY_YIELD
//! boosted = current * (implied / current) ^ BOOST_EXPONENT
//! next    = SMOOTHING * boosted + (1 - SMOOTHING) * current
//! ```
//!
//! The result is rounded and clamped to `[min, max]`. An idle link decays
//! geometrically toward `min`; a busy one grows faster than linearly toward
//! `max`.

/// Expected fraction of air sequences that come back as replies
pub const REPLY_YIELD: f64 = 0.6;

/// Convexity of the response to reply pressure
pub const BOOST_EXPONENT: f64 = 1.5;

/// Weight of the new estimate against the current count
pub const SMOOTHING: f64 = 0.5;

/// Air sequence count controller
#[derive(Debug, Clone, PartialEq)]
pub struct AirSequenceController {
    min: u32,
    max: u32,
    current: u32,
}

impl AirSequenceController {
    /// Create a controller starting at `min`.
    ///
    /// Callers validate `1 <= min <= max` beforehand; out-of-order bounds
    /// are swapped and zero is raised to one.
    pub fn new(min: u32, max: u32) -> Self {
        let min = min.max(1);
        let (min, max) = if min <= max { (min, max) } else { (max.max(1), min) };
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Current air sequence count
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Lower bound
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Fold one boost period's reply count in and return the new count
    pub fn update(&mut self, replies: u64) -> u32 {
        let current = f64::from(self.current);
        let implied = replies as f64 / REPLY_YIELD;
        let ratio = implied / current;
        let boosted = current * ratio.powf(BOOST_EXPONENT);
        let next = SMOOTHING * boosted + (1.0 - SMOOTHING) * current;

        // Float-to-int casts saturate, so huge estimates land on u32::MAX
        let rounded = next.round() as u32;
        self.current = rounded.clamp(self.min, self.max);
        self.current
    }
}
