//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file(s) (TOML)
//!     → loader.rs (parse & deserialize, resolve parameter locations)
//!     → validation.rs (semantic checks)
//!     → Config (validated, immutable)
//!     → Engine::create builds one Service per [[service]] block
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - Protocol parameters stay untyped here; each plugin interprets its own
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod parameters;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_str, load_configs, ConfigError};
pub use parameters::{Location, Parameter, ParameterValue, Parameters};
pub use schema::{
    Config, ListenAddress, ObservabilityConfig, ProtocolConfig, RemoteConfig, ServiceConfig,
};
pub use validation::{validate_config, ValidationError};
