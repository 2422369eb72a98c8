//! Configuration file support for RxP CLI tools

use rxp::{RxpConfig, RxpError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Protocol tunables shared by every tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP port
    pub udp_port: u16,
    /// UDP port of the peer's host when no relay is used
    pub peer_udp_port: u16,
    /// Relay every datagram is sent through
    pub first_hop: Option<SocketAddr>,
    pub mss: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_segments: usize,
    pub backlog: usize,
    pub initial_rto_ms: u64,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub connect_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub last_wait_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let defaults = RxpConfig::default();
        NetworkConfig {
            udp_port: defaults.udp_port,
            peer_udp_port: defaults.peer_udp_port,
            first_hop: defaults.first_hop,
            mss: defaults.mss,
            recv_buffer_size: defaults.recv_buffer_size,
            send_buffer_segments: defaults.send_buffer_segments,
            backlog: defaults.backlog,
            initial_rto_ms: defaults.initial_rto.as_millis() as u64,
            min_rto_ms: defaults.min_rto.as_millis() as u64,
            max_rto_ms: defaults.max_rto.as_millis() as u64,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            close_timeout_secs: defaults.close_timeout.as_secs(),
            last_wait_ms: defaults.last_wait.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    /// Build protocol configuration, rejecting values the protocol cannot use
    pub fn to_rxp_config(&self) -> Result<RxpConfig, ConfigError> {
        let config = RxpConfig {
            udp_port: self.udp_port,
            peer_udp_port: self.peer_udp_port,
            first_hop: self.first_hop,
            mss: self.mss,
            recv_buffer_size: self.recv_buffer_size,
            send_buffer_segments: self.send_buffer_segments.max(1),
            backlog: self.backlog.max(1),
            initial_rto: Duration::from_millis(self.initial_rto_ms),
            min_rto: Duration::from_millis(self.min_rto_ms),
            max_rto: Duration::from_millis(self.max_rto_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            last_wait: Duration::from_millis(self.last_wait_ms),
            initial_threshold: 64 * self.mss,
        };
        config.validate().map_err(|e| match e {
            RxpError::InvalidConfig(reason) => ConfigError::Invalid(reason),
            other => ConfigError::Invalid(other.to_string()),
        })?;
        Ok(config)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// RxP port to listen on
    pub port: u16,
    /// Output destination ("-" for stdout, otherwise a directory receiving
    /// one file per connection)
    #[serde(default = "default_output")]
    pub output: String,
    /// Send every received byte back to the client
    #[serde(default)]
    pub echo: bool,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_output() -> String {
    "-".to_string()
}

fn default_stats_interval() -> u64 {
    0
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// RxP address of the server
    pub server: SocketAddr,
    /// Input source (file path or "-" for stdin)
    #[serde(default = "default_input")]
    pub input: String,
    /// Read back as many bytes as were sent before closing
    #[serde(default)]
    pub expect_echo: bool,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_input() -> String {
    "-".to_string()
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// UDP address the relay listens on
    pub listen: SocketAddr,
    /// The two UDP endpoints traffic is forwarded between
    pub endpoints: [SocketAddr; 2],
    /// Probability of dropping each datagram
    #[serde(default)]
    pub loss_rate: f64,
    /// Drop every Nth datagram (0 disables)
    #[serde(default)]
    pub drop_every: u64,
    /// Probability of flipping one byte of a forwarded datagram
    #[serde(default)]
    pub corrupt_rate: f64,
    /// Seed for the loss generator; random when absent
    pub seed: Option<u64>,
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
    pub relay: Option<RelayConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Example setup: client and server on one host talking through a
    /// local relay
    pub fn example() -> Self {
        let relay_addr = SocketAddr::from(([127, 0, 0, 1], 13000));
        let server_udp = SocketAddr::from(([127, 0, 0, 1], 15000));
        let client_udp = SocketAddr::from(([127, 0, 0, 1], 15001));

        Config {
            network: NetworkConfig {
                first_hop: Some(relay_addr),
                ..Default::default()
            },
            server: Some(ServerConfig {
                port: 8080,
                output: default_output(),
                echo: true,
                stats_interval_secs: 5,
            }),
            client: Some(ClientConfig {
                server: SocketAddr::from(([127, 0, 0, 1], 8080)),
                input: default_input(),
                expect_echo: true,
                stats_interval_secs: 5,
            }),
            relay: Some(RelayConfig {
                listen: relay_addr,
                endpoints: [server_udp, client_udp],
                loss_rate: 0.05,
                drop_every: 0,
                corrupt_rate: 0.01,
                seed: None,
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl ClientConfig {
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}
