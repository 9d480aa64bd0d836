//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check every service can be turned into listeners and protocol instances
//! - Detect duplicate protocol blocks within a service
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::Config;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending item, e.g. `service[0].protocol[1]`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.services.is_empty() {
        errors.push(ValidationError::new(
            "service",
            "configuration must contain at least one service",
        ));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "'{}' is not a socket address",
                config.observability.metrics_address
            ),
        ));
    }

    for (i, service) in config.services.iter().enumerate() {
        let path = format!("service[{}]", i);

        if service.listen.is_empty() {
            errors.push(ValidationError::new(
                &path,
                "required parameter 'listen' was not given",
            ));
        }
        for (j, address) in service.listen.iter().enumerate() {
            if address.host.is_some() == address.ip.is_some() {
                errors.push(ValidationError::new(
                    format!("{}.listen[{}]", path, j),
                    "exactly one of 'host' or 'ip' must be set",
                ));
            }
        }
        if service.max_connections == 0 {
            errors.push(ValidationError::new(
                format!("{}.max_connections", path),
                "must be greater than zero",
            ));
        }
        if service.protocols.is_empty() {
            errors.push(ValidationError::new(
                &path,
                "service must configure at least one protocol",
            ));
        }

        let mut seen = HashSet::new();
        for (j, protocol) in service.protocols.iter().enumerate() {
            let proto_path = format!("{}.protocol[{}]", path, j);
            if protocol.name.trim().is_empty() {
                errors.push(ValidationError::new(&proto_path, "protocol name is empty"));
            } else if !seen.insert(protocol.name.as_str()) {
                errors.push(ValidationError::new(
                    &proto_path,
                    format!("duplicate protocol '{}' specified", protocol.name),
                ));
            }
            if protocol.remotes.is_empty() {
                errors.push(ValidationError::new(
                    &proto_path,
                    format!("protocol '{}' has no remote entries", protocol.name),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
