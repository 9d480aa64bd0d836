//! TCP listener with backpressure.
//!
//! # Responsibilities
//! - Resolve and bind one configured address
//! - Accept incoming TCP connections and hand them to the owning service
//! - Enforce max_connections via the service semaphore
//! - Stop accepting on shutdown without reporting the resulting error

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ListenAddress;
use crate::engine::service::ServiceCore;
use crate::engine::{MuxError, Result};
use crate::lifecycle::Shutdown;

/// A bound socket and, once started, its accept task.
pub struct Listener {
    address: ListenAddress,
    local_addr: SocketAddr,
    /// Present until `start` moves it into the accept task.
    inner: Option<TcpListener>,
    shutdown: Shutdown,
    stopping: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Resolve `address` and bind to it.
    ///
    /// Host names are looked up and the first record is used.
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        let target = resolve(address).await?;
        let listener = TcpListener::bind(target)
            .await
            .map_err(|source| MuxError::ListenStart {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MuxError::ListenStart {
                address: address.clone(),
                source,
            })?;

        tracing::info!(address = %address, local_addr = %local_addr, "Listener bound");

        Ok(Self {
            address: address.clone(),
            local_addr,
            inner: Some(listener),
            shutdown: Shutdown::new(),
            stopping: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    /// Begin accepting connections on behalf of `core`.
    ///
    /// Calling it on a started or stopped listener does nothing.
    pub fn start(&mut self, core: Arc<ServiceCore>) {
        let Some(listener) = self.inner.take() else {
            return;
        };
        let rx = self.shutdown.subscribe();
        let address = self.address.to_string();
        let stopping = Arc::clone(&self.stopping);
        self.task = Some(tokio::spawn(accept_loop(listener, address, core, rx, stopping)));
    }

    /// Stop accepting and wait for the accept task to exit.
    pub async fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.trigger();
        self.inner.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(address = %self.address, error = %e, "Accept task failed");
            }
        }
        tracing::info!(address = %self.address, "Listener stopped");
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn resolve(address: &ListenAddress) -> Result<SocketAddr> {
    if let Some(ip) = address.ip {
        return Ok(SocketAddr::new(ip, address.port));
    }
    let Some(host) = address.host.as_deref() else {
        return Err(MuxError::NoHostRecords(address.to_string()));
    };
    let mut records = tokio::net::lookup_host((host, address.port))
        .await
        .map_err(|source| MuxError::HostLookup {
            host: host.to_string(),
            source,
        })?;
    records
        .next()
        .ok_or_else(|| MuxError::NoHostRecords(host.to_string()))
}

async fn accept_loop(
    listener: TcpListener,
    address: String,
    core: Arc<ServiceCore>,
    mut shutdown: broadcast::Receiver<()>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            permit = Arc::clone(core.limit()).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.recv() => break,
        };

        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.recv() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                tracing::debug!(
                    service = %core.label(),
                    peer_addr = %peer_addr,
                    available_permits = core.limit().available_permits(),
                    "Connection accepted"
                );
                let local_addr = stream.local_addr().ok();
                core.add_remote(stream, local_addr, Some(peer_addr), Some(permit));
            }
            Err(source) => {
                if !stopping.load(Ordering::SeqCst) {
                    core.reporter().normal(&MuxError::Accept {
                        address: address.clone(),
                        source,
                    });
                }
                break;
            }
        }
    }
    tracing::debug!(address = %address, "Accept loop finished");
}
