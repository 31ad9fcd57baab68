//! Client agent configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().expect("valid wildcard address")
}

fn default_relay_channel_count() -> usize {
    1
}

fn default_relay_connection_ttl_secs() -> u64 {
    300
}

/// One local-port-to-relay mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Local TCP port the client agent listens on
    pub local_port: u16,

    /// Address the listener binds to (default: all interfaces)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Relay-side entity path the tunnels attach to
    pub entity_path: String,

    /// Configuration key carried in the tunnel preamble; selects the
    /// target port on the service side
    pub remote_configuration_key: i32,

    /// Firewall entries admitting local sources: `a.b.c.d`,
    /// `a.b.c.d-e.f.g.h`, or `*`. Empty admits everything.
    #[serde(default)]
    pub allowed_sources: Vec<String>,

    /// Number of concurrently-active relay tunnels for this mapping
    #[serde(default = "default_relay_channel_count")]
    pub relay_channel_count: usize,

    /// Accept-TTL per relay tunnel; expired tunnels rotate out
    #[serde(default = "default_relay_connection_ttl_secs")]
    pub relay_connection_ttl_secs: u64,
}

impl PortMapping {
    pub fn relay_connection_ttl(&self) -> Duration {
        Duration::from_secs(self.relay_connection_ttl_secs)
    }
}

/// Full client agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub mappings: Vec<PortMapping>,
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }
}

/// Configuration file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
