//! Configuration for the service registry.
//!
//! [`RegistryConfig`] holds the resolved values the registry needs: multicast
//! group, timings, and size limits. It can be built in code through
//! [`RegistryConfig::builder`] or loaded as part of an [`AppConfig`] from YAML
//! with environment variable overrides.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest record (in bytes of JSON) that still fits into 255 chunks of
/// base64 text.
pub const MAX_RECORD_SIZE_LIMIT: usize = 47_000;

/// Smallest datagram that can carry a packet header plus one full chunk.
pub const MIN_PACKET_SIZE: usize = 512;

/// Configuration for the multicast registry.
///
/// # Examples
///
/// ```
/// use lanreg_core::config::RegistryConfig;
/// use std::time::Duration;
///
/// let config = RegistryConfig::builder()
///     .service_name("greeter")
///     .ttl(Duration::from_secs(60))
///     .build()
///     .unwrap();
///
/// assert_eq!(config.ttl(), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Name of the process owning this registry, used in logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Discovery domain appended to every record name
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Multicast group to send to and listen on. A unicast address runs the
    /// transport in loopback mode.
    #[serde(default = "default_group")]
    pub group: IpAddr,

    /// UDP port of the discovery group (0 = ephemeral, loopback mode only)
    #[serde(default = "default_port")]
    pub port: u16,

    /// IPv4 interfaces to join the group on (empty = any)
    #[serde(default)]
    pub interfaces: Vec<Ipv4Addr>,

    /// IP time-to-live for outgoing multicast datagrams
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,

    /// How long a discovered entry stays valid without a refreshing announce
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// How often expired entries are swept from the cache (milliseconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// How often local nodes are re-announced (seconds)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Number of times each announce or goodbye is transmitted
    #[serde(default = "default_announce_count")]
    pub announce_count: u32,

    /// Spacing before the first repeat; doubled for each further repeat
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,

    /// How long a partial chunk set is kept waiting for its missing chunks
    #[serde(default = "default_reassembly_window")]
    pub reassembly_window_ms: u64,

    /// Upper bound on partial chunk sets held at once
    #[serde(default = "default_max_pending_records")]
    pub max_pending_records: usize,

    /// Largest accepted discovery record, in bytes
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,

    /// Largest datagram the transport will emit
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Events buffered per watcher before the oldest are dropped
    #[serde(default = "default_watch_queue_capacity")]
    pub watch_queue_capacity: usize,

    /// Outbound datagram batches buffered ahead of the writer task
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// How long stop waits for queued sends to drain (milliseconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            domain: default_domain(),
            group: default_group(),
            port: default_port(),
            interfaces: Vec::new(),
            multicast_ttl: default_multicast_ttl(),
            ttl_secs: default_ttl(),
            sweep_interval_ms: default_sweep_interval(),
            refresh_interval_secs: default_refresh_interval(),
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval(),
            reassembly_window_ms: default_reassembly_window(),
            max_pending_records: default_max_pending_records(),
            max_record_size: default_max_record_size(),
            max_packet_size: default_max_packet_size(),
            watch_queue_capacity: default_watch_queue_capacity(),
            send_queue_capacity: default_send_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl RegistryConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Returns the entry TTL as a Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Returns the sweep interval as a Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Returns the refresh interval as a Duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Returns the initial announce spacing as a Duration
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// Returns the reassembly window as a Duration
    pub fn reassembly_window(&self) -> Duration {
        Duration::from_millis(self.reassembly_window_ms)
    }

    /// Returns the shutdown drain deadline as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Returns true when the group is a real multicast address.
    pub fn is_multicast(&self) -> bool {
        self.group.is_multicast()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() || self.domain.split('.').any(|l| l.is_empty() || l.len() > 63)
        {
            return Err(ConfigError::invalid_value(
                "domain",
                format!("'{}' is not a valid domain", self.domain),
            ));
        }

        if self.port == 0 && self.is_multicast() {
            return Err(ConfigError::invalid_value(
                "port",
                "an ephemeral port is only allowed with a unicast group",
            ));
        }

        if !self.interfaces.is_empty() && !self.group.is_ipv4() {
            return Err(ConfigError::invalid_value(
                "interfaces",
                "interfaces can only be set for an IPv4 group",
            ));
        }

        let non_zero = [
            ("ttl_secs", self.ttl_secs),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("announce_count", u64::from(self.announce_count)),
            ("announce_interval_ms", self.announce_interval_ms),
            ("reassembly_window_ms", self.reassembly_window_ms),
            ("max_pending_records", self.max_pending_records as u64),
            ("watch_queue_capacity", self.watch_queue_capacity as u64),
            ("send_queue_capacity", self.send_queue_capacity as u64),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "cannot be 0"));
            }
        }

        if self.refresh_interval_secs >= self.ttl_secs {
            return Err(ConfigError::invalid_value(
                "refresh_interval_secs",
                "must be shorter than ttl_secs or local entries expire between refreshes",
            ));
        }

        if self.max_record_size == 0 || self.max_record_size > MAX_RECORD_SIZE_LIMIT {
            return Err(ConfigError::invalid_value(
                "max_record_size",
                format!("must be between 1 and {}", MAX_RECORD_SIZE_LIMIT),
            ));
        }

        if self.max_packet_size < MIN_PACKET_SIZE || self.max_packet_size > 9000 {
            return Err(ConfigError::invalid_value(
                "max_packet_size",
                format!("must be between {} and 9000", MIN_PACKET_SIZE),
            ));
        }

        Ok(())
    }
}

/// Strongly typed builder for [`RegistryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    /// Sets the owning service name.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    /// Sets the discovery domain.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    /// Sets the group address.
    pub fn group(mut self, group: impl Into<IpAddr>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Sets the group port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Adds an interface to join the group on.
    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.config.interfaces.push(interface);
        self
    }

    /// Sets the multicast IP time-to-live.
    pub fn multicast_ttl(mut self, ttl: u32) -> Self {
        self.config.multicast_ttl = ttl;
        self
    }

    /// Sets the entry TTL (whole seconds).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the refresh interval (whole seconds).
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval_secs = interval.as_secs();
        self
    }

    /// Sets how many times each announce is transmitted.
    pub fn announce_count(mut self, count: u32) -> Self {
        self.config.announce_count = count;
        self
    }

    /// Sets the initial announce spacing.
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.config.announce_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the reassembly window.
    pub fn reassembly_window(mut self, window: Duration) -> Self {
        self.config.reassembly_window_ms = window.as_millis() as u64;
        self
    }

    /// Sets the maximum record size.
    pub fn max_record_size(mut self, size: usize) -> Self {
        self.config.max_record_size = size;
        self
    }

    /// Sets the maximum datagram size.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Sets the per-watcher queue capacity.
    pub fn watch_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.watch_queue_capacity = capacity;
        self
    }

    /// Sets the shutdown drain deadline.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<RegistryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Top-level configuration file for a registry node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration using the `config` crate: the given YAML file
    /// overridden by `LANREG__*` environment variables
    /// (e.g. `LANREG__REGISTRY__PORT=5454`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let loaded = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("LANREG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let config: Self = loaded
            .try_deserialize()
            .map_err(|e| ConfigError::InvalidFormat {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid_value("logging.level", format!("Invalid log level: {}", self.level))
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default configuration values
fn default_service_name() -> String {
    "lanreg".to_string()
}

fn default_domain() -> String {
    "lanreg".to_string()
}

fn default_group() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251))
}

fn default_port() -> u16 {
    5353
}

fn default_multicast_ttl() -> u32 {
    1 // Link-local only
}

fn default_ttl() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_announce_count() -> u32 {
    3
}

fn default_announce_interval() -> u64 {
    250
}

fn default_reassembly_window() -> u64 {
    5000
}

fn default_max_pending_records() -> usize {
    1024
}

fn default_max_record_size() -> usize {
    16 * 1024
}

fn default_max_packet_size() -> usize {
    1400
}

fn default_watch_queue_capacity() -> usize {
    256
}

fn default_send_queue_capacity() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}
