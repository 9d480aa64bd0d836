//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::Config;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    load_config_str(&content, &source_name(path))
}

/// Load several files in order and merge them into one configuration.
pub fn load_configs<P: AsRef<Path>>(paths: &[P]) -> Result<Config, ConfigError> {
    let mut merged = Config::default();
    for path in paths {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        merged.merge(parse_config(&content, &source_name(path))?);
    }
    validate_config(&merged).map_err(ConfigError::Validation)?;
    Ok(merged)
}

/// Label used for parameter locations read from `path`.
fn source_name(path: &Path) -> String {
    path.display().to_string()
}

/// Parse and validate configuration text. `file_name` is only used for
/// parameter locations.
pub fn load_config_str(content: &str, file_name: &str) -> Result<Config, ConfigError> {
    let config = parse_config(content, file_name)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn parse_config(content: &str, file_name: &str) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    for service in &mut config.services {
        for protocol in &mut service.protocols {
            protocol.parameters.resolve_locations(file_name, content);
            for remote in &mut protocol.remotes {
                remote.parameters.resolve_locations(file_name, content);
            }
        }
    }
    Ok(config)
}
