//! Session configuration.

use crate::error::ConfigError;
use crate::seq_pool::MAX_POOL_CAPACITY;
use std::time::Duration;

/// Default lower bound on requests kept in the air
pub const DEFAULT_MIN_AIR_SEQ: u32 = 1;

/// Default upper bound on requests kept in the air
pub const DEFAULT_MAX_AIR_SEQ: u32 = 32;

/// Default booster period
pub const DEFAULT_BOOST_PERIOD: Duration = Duration::from_millis(500);

/// Default receive deadline; only bounds how long a reader waits before
/// re-checking for shutdown
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(30);

/// Default inbound/outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default minimum spacing between client datagrams
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(10);

/// Default receive buffer; fits the largest frame plus ICMP and IPv4 headers
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 128 * 1024;

/// Default server sequence pool capacity
pub const DEFAULT_SEQ_POOL_CAPACITY: usize = 16;

/// Client session configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session token; random nonzero when unset
    pub identify: Option<u16>,
    /// Lower air sequence bound (default 1)
    pub min_air_seq: Option<u32>,
    /// Upper air sequence bound (default 32)
    pub max_air_seq: Option<u32>,
    /// Booster recomputation period
    pub boost_period: Duration,
    /// Receive deadline used to re-poll shutdown
    pub read_deadline: Duration,
    /// Capacity of the inbound and outbound queues
    pub queue_capacity: usize,
    /// Minimum spacing between sent datagrams; `None` disables pacing
    pub send_interval: Option<Duration>,
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identify: None,
            min_air_seq: None,
            max_air_seq: None,
            boost_period: DEFAULT_BOOST_PERIOD,
            read_deadline: DEFAULT_READ_DEADLINE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_interval: Some(DEFAULT_SEND_INTERVAL),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Air sequence bounds with defaults applied
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a zero bound or `min > max`.
    pub fn air_bounds(&self) -> Result<(u32, u32), ConfigError> {
        let min = self.min_air_seq.unwrap_or(DEFAULT_MIN_AIR_SEQ);
        let max = self.max_air_seq.unwrap_or(DEFAULT_MAX_AIR_SEQ);

        if min == 0 {
            return Err(ConfigError::ZeroAirSequence(min));
        }
        if max == 0 {
            return Err(ConfigError::ZeroAirSequence(max));
        }
        if min > max {
            return Err(ConfigError::InvertedAirSequence { min, max });
        }
        Ok((min, max))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identify == Some(0) {
            return Err(ConfigError::ZeroIdentify);
        }
        self.air_bounds()?;
        if self.boost_period.is_zero() {
            return Err(ConfigError::Zero("boost_period"));
        }
        validate_common(self.read_deadline, self.queue_capacity, self.recv_buffer_size)
    }
}

/// Server session configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Sequence pool capacity (power of two, at most 32768)
    pub seq_pool_capacity: usize,
    /// Receive deadline used to re-poll shutdown
    pub read_deadline: Duration,
    /// Capacity of the inbound and outbound queues
    pub queue_capacity: usize,
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            seq_pool_capacity: DEFAULT_SEQ_POOL_CAPACITY,
            read_deadline: DEFAULT_READ_DEADLINE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.seq_pool_capacity.is_power_of_two() || self.seq_pool_capacity > MAX_POOL_CAPACITY
        {
            return Err(ConfigError::InvalidPoolCapacity(self.seq_pool_capacity));
        }
        validate_common(self.read_deadline, self.queue_capacity, self.recv_buffer_size)
    }
}

fn validate_common(
    read_deadline: Duration,
    queue_capacity: usize,
    recv_buffer_size: usize,
) -> Result<(), ConfigError> {
    if read_deadline.is_zero() {
        return Err(ConfigError::Zero("read_deadline"));
    }
    if queue_capacity == 0 {
        return Err(ConfigError::Zero("queue_capacity"));
    }
    if recv_buffer_size == 0 {
        return Err(ConfigError::Zero("recv_buffer_size"));
    }
    Ok(())
}
