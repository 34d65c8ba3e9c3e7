//! Configuration system for the icmptun CLI.

use icmptun_core::config::{
    DEFAULT_BOOST_PERIOD, DEFAULT_QUEUE_CAPACITY, DEFAULT_READ_DEADLINE, DEFAULT_SEND_INTERVAL,
    DEFAULT_SEQ_POOL_CAPACITY,
};
use icmptun_core::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// icmptun configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Local IPv4 address to bind the raw socket to
    #[serde(default = "default_any_addr")]
    pub local: String,
    /// Server IPv4 address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Fixed session token (random when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identify: Option<u16>,
    /// Lower bound on requests kept in the air
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_air_seq: Option<u32>,
    /// Upper bound on requests kept in the air
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_air_seq: Option<u32>,
    /// Booster period in milliseconds
    #[serde(default = "default_boost_period_ms")]
    pub boost_period_ms: u64,
    /// Minimum spacing between datagrams in milliseconds (0 disables)
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    /// Receive deadline in seconds
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,
    /// Inbound/outbound queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Local IPv4 address to bind the raw socket to
    #[serde(default = "default_any_addr")]
    pub local: String,
    /// Peer filter; `0.0.0.0` binds to the first client
    #[serde(default = "default_any_addr")]
    pub remote: String,
    /// Sequence pool capacity (power of two)
    #[serde(default = "default_seq_pool_size")]
    pub seq_pool_size: usize,
    /// Receive deadline in seconds
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,
    /// Inbound/outbound queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_any_addr() -> String {
    Ipv4Addr::UNSPECIFIED.to_string()
}

fn default_boost_period_ms() -> u64 {
    DEFAULT_BOOST_PERIOD.as_millis() as u64
}

fn default_send_interval_ms() -> u64 {
    DEFAULT_SEND_INTERVAL.as_millis() as u64
}

fn default_read_deadline_secs() -> u64 {
    DEFAULT_READ_DEADLINE.as_secs()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_seq_pool_size() -> usize {
    DEFAULT_SEQ_POOL_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            local: default_any_addr(),
            remote: None,
            identify: None,
            min_air_seq: None,
            max_air_seq: None,
            boost_period_ms: default_boost_period_ms(),
            send_interval_ms: default_send_interval_ms(),
            read_deadline_secs: default_read_deadline_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            local: default_any_addr(),
            remote: default_any_addr(),
            seq_pool_size: default_seq_pool_size(),
            read_deadline_secs: default_read_deadline_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientSection {
    /// Parse the local bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not IPv4.
    pub fn local_addr(&self) -> anyhow::Result<Ipv4Addr> {
        parse_ipv4(&self.local, "client local address")
    }

    /// Parse the server address
    ///
    /// # Errors
    ///
    /// Returns an error if no remote is configured or it is not a unicast
    /// IPv4 address.
    pub fn remote_addr(&self) -> anyhow::Result<Ipv4Addr> {
        let remote = match &self.remote {
            Some(remote) => parse_ipv4(remote, "client remote address")?,
            None => anyhow::bail!("Client remote address is required (--remote or [client] remote)"),
        };
        if remote.is_unspecified() || remote.is_broadcast() {
            anyhow::bail!("Client remote address must be a unicast host: {}", remote);
        }
        Ok(remote)
    }

    /// Build the session configuration
    #[must_use]
    pub fn session_config(&self) -> ClientConfig {
        ClientConfig {
            identify: self.identify,
            min_air_seq: self.min_air_seq,
            max_air_seq: self.max_air_seq,
            boost_period: Duration::from_millis(self.boost_period_ms),
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            queue_capacity: self.queue_capacity,
            send_interval: (self.send_interval_ms > 0)
                .then(|| Duration::from_millis(self.send_interval_ms)),
            ..ClientConfig::default()
        }
    }
}

impl ServerSection {
    /// Parse the local bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not IPv4.
    pub fn local_addr(&self) -> anyhow::Result<Ipv4Addr> {
        parse_ipv4(&self.local, "server local address")
    }

    /// Parse the peer filter
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not IPv4.
    pub fn remote_addr(&self) -> anyhow::Result<Ipv4Addr> {
        parse_ipv4(&self.remote, "server remote filter")
    }

    /// Build the session configuration
    #[must_use]
    pub fn session_config(&self) -> ServerConfig {
        ServerConfig {
            seq_pool_capacity: self.seq_pool_size,
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            queue_capacity: self.queue_capacity,
            ..ServerConfig::default()
        }
    }
}

fn parse_ipv4(value: &str, name: &str) -> anyhow::Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {}: '{}' (expected IPv4)", name, value))
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Save to a file, refusing to replace an existing one unless `force` is set
    pub fn save_new<P: AsRef<Path>>(&self, path: P, force: bool) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                path.display()
            );
        }
        self.save(path)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("icmptun/config.toml")
    }

    /// Load config from the default path, falling back to defaults when the
    /// file does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the parts every command needs
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }

    /// Validate the client section
    ///
    /// # Errors
    ///
    /// Returns an error if client configuration is invalid.
    pub fn validate_client(&self) -> anyhow::Result<()> {
        self.validate()?;
        self.client.local_addr()?;
        self.client.remote_addr()?;
        self.client.session_config().validate()?;
        Ok(())
    }

    /// Validate the server section
    ///
    /// # Errors
    ///
    /// Returns an error if server configuration is invalid.
    pub fn validate_server(&self) -> anyhow::Result<()> {
        self.validate()?;
        self.server.local_addr()?;
        self.server.remote_addr()?;
        self.server.session_config().validate()?;
        Ok(())
    }
}
