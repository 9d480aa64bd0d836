//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure handed to the
//! engine. All types derive Serde traits for deserialization from config files.

use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;

use crate::config::parameters::Parameters;

/// Root configuration for the multiplexer.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Service blocks, one engine Service each.
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Fold another configuration into this one.
    ///
    /// Services are appended in order; observability settings of `other` win.
    pub fn merge(&mut self, other: Config) {
        self.observability = other.observability;
        self.services.extend(other.services);
    }
}

/// A set of listen addresses sharing one ordered list of protocols.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Optional label used in logs and metrics.
    #[serde(default)]
    pub name: Option<String>,

    /// Addresses to listen on.
    #[serde(default)]
    pub listen: Vec<ListenAddress>,

    /// Maximum concurrent physical connections (backpressure).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Candidate protocols, evaluated concurrently on every connection.
    #[serde(rename = "protocol", default)]
    pub protocols: Vec<ProtocolConfig>,
}

fn default_max_connections() -> usize {
    10_000
}

impl ServiceConfig {
    /// Label for this service, falling back to its position in the config.
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("service-{}", index))
    }
}

/// One protocol block: a registered protocol name, its shared parameters,
/// and the remotes it serves.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Registry name of the protocol implementation.
    pub name: String,

    /// Parameters shared by every remote of this protocol.
    #[serde(default)]
    pub parameters: Parameters,

    /// Remote entries; each becomes one protocol instance.
    #[serde(rename = "remote", default)]
    pub remotes: Vec<RemoteConfig>,
}

/// A single remote entry of a protocol block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Remote identifier for logging.
    pub name: String,

    /// Parameters specific to this remote.
    #[serde(default)]
    pub parameters: Parameters,
}

/// Host-or-IP plus port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenAddress {
    /// Host name, resolved at listen time.
    #[serde(default)]
    pub host: Option<String>,

    /// Literal IP address.
    #[serde(default)]
    pub ip: Option<IpAddr>,

    /// TCP port.
    pub port: u16,
}

impl ListenAddress {
    /// Address from a literal IP.
    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: None,
            ip: Some(ip),
            port,
        }
    }

    /// Address from a host name.
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            ip: None,
            port,
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.ip) {
            (Some(host), _) => write!(f, "{}:{}", host, self.port),
            (None, Some(IpAddr::V6(ip))) => write!(f, "[{}]:{}", ip, self.port),
            (None, Some(ip)) => write!(f, "{}:{}", ip, self.port),
            (None, None) => write!(f, "<unspecified>:{}", self.port),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
