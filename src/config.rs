//! Configuration management for connlimit.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConnLimitError, Result};

/// Prefix for environment overrides, e.g. `CONNLIMIT__THROTTLE__PACKET_LIMIT`.
const ENV_PREFIX: &str = "CONNLIMIT";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the connlimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnLimitConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP listen address
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: SocketAddr,

    /// Optional UDP listen address
    #[serde(default)]
    pub udp_addr: Option<SocketAddr>,

    /// Largest chunk read from a TCP connection per readable event
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_tcp_addr(),
            udp_addr: None,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_tcp_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

/// Which metering policy a listener uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Count messages per second
    #[default]
    Packet,
    /// Count bytes per second
    Traffic,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Metering policy
    #[serde(default)]
    pub policy: PolicyKind,

    /// Default packets per second for the packet policy
    #[serde(default = "default_packet_limit")]
    pub packet_limit: u64,

    /// Default bytes per second for the traffic policy
    #[serde(default = "default_traffic_limit")]
    pub traffic_limit: u64,

    /// Per-peer limits, in the active policy's unit
    #[serde(default)]
    pub overrides: Vec<LimitOverride>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            packet_limit: default_packet_limit(),
            traffic_limit: default_traffic_limit(),
            overrides: Vec::new(),
        }
    }
}

fn default_packet_limit() -> u64 {
    100
}

fn default_traffic_limit() -> u64 {
    1024 * 1024
}

/// A limit for every connection from one peer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    pub peer: IpAddr,
    pub limit: u64,
}

impl ThrottleConfig {
    /// Default limit of the configured policy.
    pub fn default_limit(&self) -> u64 {
        match self.policy {
            PolicyKind::Packet => self.packet_limit,
            PolicyKind::Traffic => self.traffic_limit,
        }
    }

    /// Set the default limit of the configured policy.
    pub fn set_default_limit(&mut self, limit: u64) {
        match self.policy {
            PolicyKind::Packet => self.packet_limit = limit,
            PolicyKind::Traffic => self.traffic_limit = limit,
        }
    }

    /// Overrides keyed by peer address. Later entries win.
    pub fn peer_limits(&self) -> HashMap<IpAddr, u64> {
        self.overrides
            .iter()
            .map(|o| (o.peer, o.limit))
            .collect()
    }
}

impl ConnLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConnLimitError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer an optional YAML file and `CONNLIMIT__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: ConnLimitConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let throttle = &self.throttle;
        if throttle.packet_limit == 0 {
            return Err(ConnLimitError::Config("packet_limit must be positive".to_string()));
        }
        if throttle.traffic_limit == 0 {
            return Err(ConnLimitError::Config("traffic_limit must be positive".to_string()));
        }
        if let Some(o) = throttle.overrides.iter().find(|o| o.limit == 0) {
            return Err(ConnLimitError::Config(format!(
                "override for {} must have a positive limit",
                o.peer
            )));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(ConnLimitError::Config("max_frame_bytes must be positive".to_string()));
        }

        if throttle.policy == PolicyKind::Traffic
            && self.server.max_frame_bytes as u64 > throttle.traffic_limit
        {
            // A full-sized read could never fit into one window.
            warn!(
                max_frame_bytes = self.server.max_frame_bytes,
                traffic_limit = throttle.traffic_limit,
                "max_frame_bytes exceeds the traffic limit"
            );
        }
        Ok(())
    }
}
