//! Storage-side contracts the engine consumes.
//!
//! Everything durable lives behind `SchedulerRepository`: queue item
//! persistence, lease rows, rate-limit counters, and the concurrency
//! strategy evaluation. Each call is treated as atomic by the engine, and
//! every error from here is treated as transient: the calling loop logs it
//! and retries on its next tick.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{
    ConcurrencyResults, ConcurrencyStrategyRow, DesiredLabel, Lease, LeaseKind, QueueItem,
    TaskRateLimits, Worker, WorkerAction, WorkerSlotCount,
};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage call timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),
}

/// Run one storage call under a wall-clock budget. An elapsed budget
/// surfaces as `RepositoryError::Timeout`, which callers treat like any
/// other transient storage error.
pub async fn storage_call<T>(
    budget_ms: u64,
    fut: impl std::future::Future<Output = Result<T, RepositoryError>>,
) -> Result<T, RepositoryError> {
    match tokio::time::timeout(std::time::Duration::from_millis(budget_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(RepositoryError::Timeout),
    }
}

/// One assignment pending persistence, tied back to its unacked slot.
#[derive(Debug, Clone)]
pub struct FlushAssigned {
    pub ack_id: u64,
    pub worker_id: String,
    pub item: QueueItem,
}

/// The decisions a queuer flushes to storage in one call.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFlush {
    pub queue: String,
    pub assigned: Vec<FlushAssigned>,
    pub unassigned: Vec<QueueItem>,
    pub scheduling_timed_out: Vec<QueueItem>,
}

/// Which assigned item ids storage committed and which it rejected.
/// Rejected items get their slots nacked and are re-offered.
#[derive(Debug, Clone, Default)]
pub struct MarkedResults {
    pub succeeded: Vec<i64>,
    pub failed: Vec<i64>,
}

/// The durable storage contract behind the scheduling engine.
///
/// Implementations are expected to make each method atomic with respect to
/// concurrent scheduler replicas; in particular `acquire_or_extend_leases`
/// must uphold at most one active lease per (tenant, kind, resource).
#[async_trait]
pub trait SchedulerRepository: Send + Sync {
    // Workers and capacity.
    async fn list_active_workers(&self, tenant: &str) -> Result<Vec<Worker>, RepositoryError>;

    async fn list_available_slots(
        &self,
        tenant: &str,
        worker_ids: &[String],
    ) -> Result<Vec<WorkerSlotCount>, RepositoryError>;

    async fn list_actions_for_workers(
        &self,
        tenant: &str,
        worker_ids: &[String],
    ) -> Result<Vec<WorkerAction>, RepositoryError>;

    // Leases.
    async fn list_queues(&self, tenant: &str) -> Result<Vec<String>, RepositoryError>;

    async fn list_concurrency_strategies(
        &self,
        tenant: &str,
    ) -> Result<Vec<ConcurrencyStrategyRow>, RepositoryError>;

    /// Acquire leases for newly-seen resources and extend the ones in
    /// `current`, in a single storage round trip. Returns the full set of
    /// leases now held by this caller.
    async fn acquire_or_extend_leases(
        &self,
        tenant: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        current: &[Lease],
    ) -> Result<Vec<Lease>, RepositoryError>;

    async fn release_leases(&self, tenant: &str, leases: Vec<Lease>)
        -> Result<(), RepositoryError>;

    // Queue items.
    async fn list_queue_items(
        &self,
        tenant: &str,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<QueueItem>, RepositoryError>;

    async fn get_task_rate_limits(
        &self,
        tenant: &str,
        items: &[QueueItem],
    ) -> Result<TaskRateLimits, RepositoryError>;

    async fn get_desired_labels(
        &self,
        tenant: &str,
        step_ids: &[String],
    ) -> Result<HashMap<String, Vec<DesiredLabel>>, RepositoryError>;

    async fn mark_queue_items_processed(
        &self,
        tenant: &str,
        flush: &AssignmentFlush,
    ) -> Result<MarkedResults, RepositoryError>;

    // Rate limits.
    /// Apply consumed deltas and return the authoritative values for every
    /// bucket the tenant has configured.
    async fn update_rate_limits(
        &self,
        tenant: &str,
        deltas: &HashMap<String, i64>,
    ) -> Result<HashMap<String, i64>, RepositoryError>;

    // Concurrency strategies.
    async fn run_concurrency_strategy(
        &self,
        tenant: &str,
        strategy: &ConcurrencyStrategyRow,
    ) -> Result<ConcurrencyResults, RepositoryError>;

    async fn update_strategy_active(
        &self,
        tenant: &str,
        strategy_id: i64,
    ) -> Result<bool, RepositoryError>;

    async fn list_child_strategies(
        &self,
        tenant: &str,
        parent_id: i64,
    ) -> Result<Vec<ConcurrencyStrategyRow>, RepositoryError>;

    // Batches.
    async fn list_batched_queue_items(
        &self,
        tenant: &str,
        step_id: &str,
        batch_key: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, RepositoryError>;

    /// Filter `item_ids` down to the ones that still exist (items can be
    /// cancelled between buffering and flush).
    async fn list_existing_batch_item_ids(
        &self,
        tenant: &str,
        item_ids: &[i64],
    ) -> Result<Vec<i64>, RepositoryError>;

    async fn delete_batched_queue_items(
        &self,
        tenant: &str,
        item_ids: &[i64],
    ) -> Result<(), RepositoryError>;

    /// Commit a whole buffered batch as one atomic group against a single
    /// worker slot.
    async fn commit_batch_assignments(
        &self,
        tenant: &str,
        worker_id: &str,
        batch_id: &str,
        items: &[QueueItem],
    ) -> Result<(), RepositoryError>;

    async fn count_active_batch_runs(
        &self,
        tenant: &str,
        step_id: &str,
    ) -> Result<i64, RepositoryError>;

    async fn get_batch_config(
        &self,
        tenant: &str,
        step_id: &str,
    ) -> Result<Option<crate::types::BatchConfig>, RepositoryError>;
}
