//! Rearmable keepalive timer.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// One-shot timer whose period can change and whose pending fire can be
/// pushed back.
///
/// `tick` is cancel-safe and can sit in a `tokio::select!` next to other
/// wakeups; once it fires the timer rearms itself for one more period.
#[derive(Debug)]
pub struct KeepaliveTimer {
    sleep: Pin<Box<Sleep>>,
    period: Duration,
    armed_at: Instant,
}

impl KeepaliveTimer {
    /// Timer first firing one `period` from now
    pub fn new(period: Duration) -> Self {
        let armed_at = Instant::now();
        Self {
            sleep: Box::pin(tokio::time::sleep_until(armed_at + period)),
            period,
            armed_at,
        }
    }

    /// Current period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Next fire time
    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }

    /// Push the pending fire back to one period from now
    pub fn reset(&mut self) {
        self.armed_at = Instant::now();
        self.sleep.as_mut().reset(self.armed_at + self.period);
    }

    /// Change the period of the pending fire.
    ///
    /// The deadline moves to one new period after the timer was last armed;
    /// if that is already past, the next `tick` fires immediately.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
        self.sleep.as_mut().reset(self.armed_at + period);
    }

    /// Wait for the timer to fire, then rearm it
    pub async fn tick(&mut self) {
        self.sleep.as_mut().await;
        self.reset();
    }
}
