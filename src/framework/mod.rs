//! Contract between the engine and protocol plugins.
//!
//! # Data Flow
//! ```text
//! plugins register a Protocol by name   → ProtocolRegistry
//! Engine::create, per remote entry      → Protocol::configure → ProtocolInstance
//! per accepted socket, per instance     → ProtocolInstance::handle(Connection)
//! ```
//!
//! # Design Decisions
//! - The registry is an explicit value passed to the engine, never global
//! - The plugin set is open, so dispatch goes through trait objects

pub mod registry;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Parameters;
use crate::engine::{Connection, Result};

pub use registry::ProtocolRegistry;

/// A loadable protocol implementation.
pub trait Protocol: Send + Sync {
    /// Build an instance for one remote entry.
    ///
    /// Called once per remote at engine build time. Implementations must
    /// reject parameter names they do not recognise.
    fn configure(
        &self,
        globals: &Parameters,
        remote_name: &str,
        remote_params: &Parameters,
    ) -> Result<Arc<dyn ProtocolInstance>>;
}

/// A configured protocol handler.
#[async_trait]
pub trait ProtocolInstance: Send + Sync {
    /// Serve one physical connection.
    ///
    /// Runs on its own task for every accepted socket. `Ok(())` means the
    /// session was fully serviced; an error means mismatch or I/O failure.
    /// Bytes written before [`Connection::require_exclusive`] only reach the
    /// wire while every other candidate writes the same bytes.
    async fn handle(&self, conn: Connection) -> Result<()>;
}

/// A protocol instance bound to the names it was configured under.
#[derive(Clone)]
pub struct ConfiguredProtocol {
    /// Registry name of the protocol.
    pub protocol: String,
    /// Name of the remote entry this instance serves.
    pub remote: String,
    pub instance: Arc<dyn ProtocolInstance>,
}

impl std::fmt::Debug for ConfiguredProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredProtocol")
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .finish()
    }
}
