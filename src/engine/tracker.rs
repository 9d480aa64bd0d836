//! Live remote connection bookkeeping.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track the RemoteConnections a Service still owns
//! - Hand the Service a snapshot to force-close on shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::RemoteConnection;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Set of RemoteConnections owned by one Service.
///
/// A RemoteConnection inserts itself on creation and removes itself once
/// its teardown has joined every task.
#[derive(Debug, Default)]
pub struct RemoteTracker {
    remotes: Mutex<HashMap<ConnectionId, Arc<RemoteConnection>>>,
}

impl RemoteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, remote: Arc<RemoteConnection>) {
        let mut remotes = self.lock();
        if remotes.insert(remote.id(), remote).is_none() {
            metrics::adjust_active_remotes(1.0);
        }
    }

    pub(crate) fn release(&self, id: ConnectionId) {
        if self.lock().remove(&id).is_some() {
            metrics::adjust_active_remotes(-1.0);
            tracing::trace!(connection_id = %id, "Remote connection released");
        }
    }

    /// Get current live remote count.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every remote currently tracked.
    pub fn snapshot(&self) -> Vec<Arc<RemoteConnection>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<RemoteConnection>>> {
        self.remotes.lock().expect("remote tracker mutex poisoned")
    }
}
