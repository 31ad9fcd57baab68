//! Relay listener metadata
//!
//! The service-side agent reads relay-supplied user metadata once, when its
//! relay listener opens. The metadata is a JSON array of key/value entries;
//! the `endpoint` entry carries `"<host>:<allowed-ports>"` where
//! allowed-ports is `*` or a comma-separated list. The agent validates each
//! tunnel preamble's configuration key against the allowed ports before
//! dialing out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata parse errors; all are configuration errors fatal at listener open
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata is not a JSON entry array: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("metadata has no 'endpoint' entry")]
    MissingEndpoint,

    #[error("malformed endpoint value '{0}', expected '<host>:<ports>'")]
    MalformedEndpoint(String),

    #[error("unparseable port '{0}' in endpoint value")]
    InvalidPort(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataEntry {
    key: String,
    value: String,
}

/// The set of target ports a service listener will tunnel to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSet {
    /// `*`: any port
    Any,
    /// Explicit comma-separated list
    List(Vec<u16>),
}

impl PortSet {
    pub fn allows(&self, port: u16) -> bool {
        match self {
            PortSet::Any => true,
            PortSet::List(ports) => ports.contains(&port),
        }
    }
}

/// Parsed `endpoint` metadata for one service-side relay listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMetadata {
    /// Host the service agent dials for each new logical connection
    pub target_host: String,
    /// Ports the agent is willing to dial
    pub allowed_ports: PortSet,
}

impl EndpointMetadata {
    /// Parse the listener's raw user metadata document
    pub fn parse(raw: &str) -> Result<Self, MetadataError> {
        let entries: Vec<MetadataEntry> = serde_json::from_str(raw)?;
        let endpoint = entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case("endpoint"))
            .ok_or(MetadataError::MissingEndpoint)?;
        Self::parse_endpoint_value(&endpoint.value)
    }

    /// Parse an endpoint value `"<host>:<allowed-ports>"`
    pub fn parse_endpoint_value(value: &str) -> Result<Self, MetadataError> {
        let (host, ports) = value
            .rsplit_once(':')
            .ok_or_else(|| MetadataError::MalformedEndpoint(value.to_string()))?;
        if host.is_empty() {
            return Err(MetadataError::MalformedEndpoint(value.to_string()));
        }

        let allowed_ports = if ports.trim() == "*" {
            PortSet::Any
        } else {
            let mut list = Vec::new();
            for part in ports.split(',') {
                let port = part
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| MetadataError::InvalidPort(part.trim().to_string()))?;
                list.push(port);
            }
            PortSet::List(list)
        };

        Ok(Self {
            target_host: host.to_string(),
            allowed_ports,
        })
    }

    /// Render a metadata document for this endpoint (used by listeners that
    /// publish their own metadata, and by tests)
    pub fn to_document(&self) -> String {
        let ports = match &self.allowed_ports {
            PortSet::Any => "*".to_string(),
            PortSet::List(ports) => ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
        };
        let entries = vec![MetadataEntry {
            key: "endpoint".to_string(),
            value: format!("{}:{}", self.target_host, ports),
        }];
        serde_json::to_string(&entries).expect("metadata document serializes")
    }
}
