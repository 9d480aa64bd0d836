//! The multiplexing engine.
//!
//! # Data Flow
//! ```text
//! Engine::create: Config + ProtocolRegistry
//!     → configure every (protocol, remote) pair → bind every listen address
//!
//! Engine::start → per listener accept loop
//!     → accepted socket → RemoteConnection
//!         → one task per protocol instance, each handed a Connection
//!         → read fan-out loop + write reconciliation loop
//!
//! Engine::stop → stop accepting → force-close every RemoteConnection
//! ```
//!
//! # Design Decisions
//! - Building is all-or-nothing: protocols are configured before any
//!   socket is bound, and a failed bind drops whatever was bound before it
//! - Nothing after `start` returns an error to the caller; failures go to
//!   the [`Reporter`] and the affected resource is torn down

pub mod connection;
pub mod error;
pub mod listener;
pub mod remote;
pub mod report;
pub mod service;
pub mod tracker;

use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::framework::{ConfiguredProtocol, ProtocolRegistry};

pub use connection::Connection;
pub use error::{MuxError, Result};
pub use listener::Listener;
pub use remote::{RemoteConnection, RemoteContext, RemoteState, Socket, READ_BUFFER_SIZE};
pub use report::Reporter;
pub use service::Service;
pub use tracker::{ConnectionId, RemoteTracker};

/// Every service described by a configuration.
#[derive(Debug)]
pub struct Engine {
    services: Vec<Service>,
    reporter: Arc<Reporter>,
}

impl Engine {
    /// Configure every protocol instance, then bind every listener.
    ///
    /// Nothing accepts connections until [`Engine::start`].
    pub async fn create(config: &Config, registry: &ProtocolRegistry) -> Result<Self> {
        let reporter = Arc::new(Reporter::new());

        let mut plans = Vec::with_capacity(config.services.len());
        for (index, service) in config.services.iter().enumerate() {
            let mut configured = Vec::new();
            for protocol in &service.protocols {
                let implementation = registry
                    .get(&protocol.name)
                    .ok_or_else(|| MuxError::UnknownProtocol(protocol.name.clone()))?;
                for remote in &protocol.remotes {
                    let instance = implementation.configure(
                        &protocol.parameters,
                        &remote.name,
                        &remote.parameters,
                    )?;
                    configured.push(ConfiguredProtocol {
                        protocol: protocol.name.clone(),
                        remote: remote.name.clone(),
                        instance,
                    });
                }
            }
            plans.push((service.label(index), service, configured));
        }

        let mut services = Vec::with_capacity(plans.len());
        for (label, service, configured) in plans {
            services.push(Service::create(label, service, configured, Arc::clone(&reporter)).await?);
        }

        Ok(Self { services, reporter })
    }

    /// Begin accepting on every listener.
    pub fn start(&mut self) {
        for service in &mut self.services {
            service.start();
        }
        tracing::info!(services = self.services.len(), "Engine started");
    }

    /// Stop every service and wait for all connections to be torn down.
    pub async fn stop(&mut self) {
        join_all(self.services.iter_mut().map(|service| service.stop())).await;
        tracing::info!("Engine stopped");
    }

    /// Bound address of every listener, service by service.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.services.iter().flat_map(Service::local_addrs).collect()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }
}
