//! Pluggable observers over scheduling activity.
//!
//! Extensions receive by-value snapshots and result batches after the fact.
//! They never hold scheduler locks and cannot influence assignment; a slow
//! extension slows its own hook, nothing else.

use std::sync::{Arc, RwLock};

use crate::types::QueueResults;

/// Point-in-time view of one action's slot pool.
#[derive(Debug, Clone)]
pub struct ActionSnapshot {
    pub action_id: String,
    pub total_slots: usize,
    pub active_slots: usize,
}

/// Point-in-time view of a tenant scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub tenant_id: String,
    pub actions: Vec<ActionSnapshot>,
    pub unacked_slots: usize,
    pub workers: usize,
    pub taken_at_ms: i64,
}

/// Observer hooks. All methods have defaults so implementors opt into only
/// the events they care about.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Called after each queue cycle with the full per-queue results.
    fn post_assign(&self, _results: &QueueResults) {}

    /// Called on the snapshot cadence with current scheduler counts.
    fn post_snapshot(&self, _snapshot: &SchedulerSnapshot) {}

    /// Called once when the owning pool shuts down.
    fn cleanup(&self) {}
}

/// Shared registry handed to every tenant manager.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: Arc<RwLock<Vec<Arc<dyn Extension>>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, extension: Arc<dyn Extension>) {
        self.extensions.write().unwrap().push(extension);
    }

    pub fn post_assign(&self, results: &QueueResults) {
        for ext in self.extensions.read().unwrap().iter() {
            ext.post_assign(results);
        }
    }

    pub fn post_snapshot(&self, snapshot: &SchedulerSnapshot) {
        for ext in self.extensions.read().unwrap().iter() {
            ext.post_snapshot(snapshot);
        }
    }

    pub fn cleanup(&self) {
        for ext in self.extensions.read().unwrap().iter() {
            ext.cleanup();
        }
    }
}
