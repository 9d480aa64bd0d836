//! A set of listeners sharing one ordered list of protocol instances.

use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServiceConfig;
use crate::engine::listener::Listener;
use crate::engine::remote::{RemoteContext, Socket};
use crate::engine::{RemoteConnection, RemoteTracker, Reporter, Result};
use crate::framework::ConfiguredProtocol;
use crate::observability::metrics;

/// State shared between a Service and its accept tasks.
pub struct ServiceCore {
    label: String,
    protocols: Vec<ConfiguredProtocol>,
    tracker: Arc<RemoteTracker>,
    reporter: Arc<Reporter>,
    limit: Arc<Semaphore>,
}

impl ServiceCore {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    pub(crate) fn limit(&self) -> &Arc<Semaphore> {
        &self.limit
    }

    /// Start multiplexing an accepted socket across every protocol instance.
    pub(crate) fn add_remote<S: Socket>(
        &self,
        socket: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<RemoteConnection> {
        metrics::record_accept(&self.label);
        RemoteConnection::spawn(
            socket,
            local_addr,
            peer_addr,
            &self.protocols,
            RemoteContext {
                reporter: Arc::clone(&self.reporter),
                tracker: Some(Arc::clone(&self.tracker)),
                permit,
            },
        )
    }
}

/// Listeners plus the protocol instances every accepted socket is offered to.
pub struct Service {
    core: Arc<ServiceCore>,
    listeners: Vec<Listener>,
}

impl Service {
    /// Bind every listen address of `config`.
    ///
    /// Listeners bound before a failure are dropped, which closes them.
    pub async fn create(
        label: String,
        config: &ServiceConfig,
        protocols: Vec<ConfiguredProtocol>,
        reporter: Arc<Reporter>,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(config.listen.len());
        for address in &config.listen {
            listeners.push(Listener::bind(address).await?);
        }

        tracing::info!(
            service = %label,
            listeners = listeners.len(),
            protocols = protocols.len(),
            max_connections = config.max_connections,
            "Service created"
        );

        Ok(Self {
            core: Arc::new(ServiceCore {
                label,
                protocols,
                tracker: Arc::new(RemoteTracker::new()),
                reporter,
                limit: Arc::new(Semaphore::new(config.max_connections)),
            }),
            listeners,
        })
    }

    /// Start every listener's accept loop.
    pub fn start(&mut self) {
        for listener in &mut self.listeners {
            listener.start(Arc::clone(&self.core));
        }
    }

    /// Stop accepting, then force-close every live remote connection.
    ///
    /// Returns once all of them have been torn down.
    pub async fn stop(&mut self) {
        for listener in &mut self.listeners {
            listener.stop().await;
        }

        let remotes = self.core.tracker.snapshot();
        if !remotes.is_empty() {
            tracing::info!(
                service = %self.core.label,
                remotes = remotes.len(),
                "Closing remote connections"
            );
        }
        join_all(remotes.iter().map(|remote| remote.close())).await;
        tracing::info!(service = %self.core.label, "Service stopped");
    }

    /// Multiplex a socket that did not come from one of the listeners.
    ///
    /// Counts against max_connections when a slot is free but never waits
    /// for one.
    pub fn add_socket<S: Socket>(&self, socket: S) -> Arc<RemoteConnection> {
        let permit = Arc::clone(&self.core.limit).try_acquire_owned().ok();
        self.core.add_remote(socket, None, None, permit)
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Bound address of each listener, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Physical connections not yet torn down.
    pub fn active_remotes(&self) -> usize {
        self.core.tracker.active_count()
    }

    pub fn remotes(&self) -> Vec<Arc<RemoteConnection>> {
        self.core.tracker.snapshot()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("label", &self.core.label)
            .field("local_addrs", &self.local_addrs())
            .field("protocols", &self.core.protocols)
            .finish()
    }
}
