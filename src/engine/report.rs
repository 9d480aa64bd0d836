//! Centralised error reporting.
//!
//! Everything that happens after `Engine::start` is asynchronous, so errors
//! are routed here instead of being returned:
//! - non-critical: logged and otherwise ignored
//! - normal: logged; the caller tears down the resource it belongs to

use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::MuxError;
use crate::observability::metrics;

/// Severity-levelled error sink shared by every engine component.
#[derive(Debug, Default)]
pub struct Reporter {
    non_critical: AtomicU64,
    normal: AtomicU64,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an error that needs no further action.
    pub fn non_critical(&self, error: &MuxError) {
        self.non_critical.fetch_add(1, Ordering::Relaxed);
        metrics::record_error("non_critical");
        tracing::debug!(error = %error, "Non-critical error");
    }

    /// Report an error whose resource is being torn down.
    pub fn normal(&self, error: &MuxError) {
        self.normal.fetch_add(1, Ordering::Relaxed);
        metrics::record_error("normal");
        tracing::warn!(error = %error, "Error");
    }

    pub fn non_critical_count(&self) -> u64 {
        self.non_critical.load(Ordering::Relaxed)
    }

    pub fn normal_count(&self) -> u64 {
        self.normal.load(Ordering::Relaxed)
    }
}
