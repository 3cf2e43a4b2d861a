//! Batch scheduling.
//!
//! Items carrying a batch key never go through direct assignment. A
//! coordinator per (step, batch key) buffers them until the configured size
//! is reached or the flush interval elapses, then commits the whole group
//! against a single worker slot, all-or-nothing. Coordinators spin up on
//! demand and stop themselves after sitting idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::extensions::ExtensionRegistry;
use crate::repository::{storage_call, RepositoryError, SchedulerRepository};
use crate::scheduler::{AssignResult, Scheduler};
use crate::rate_limiter::RateLimiter;
use crate::settings::SchedulingConfig;
use crate::types::{
    now_epoch_ms, AssignedItem, BatchConfig, BatchFlushReason, BatchMetadata, QueueId, QueueItem,
    QueueResults,
};

/// Spawns and tracks batch coordinators for one tenant.
pub struct BatchRegistry {
    tenant_id: String,
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    scheduler: Arc<Scheduler>,
    limiter: Arc<RateLimiter>,
    extensions: ExtensionRegistry,
    results_tx: mpsc::Sender<QueueResults>,
    shutdown_rx: watch::Receiver<bool>,
    coordinators: std::sync::Mutex<HashMap<(String, String), CoordinatorHandle>>,
}

struct CoordinatorHandle {
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl BatchRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        repo: Arc<dyn SchedulerRepository>,
        config: Arc<SchedulingConfig>,
        scheduler: Arc<Scheduler>,
        limiter: Arc<RateLimiter>,
        extensions: ExtensionRegistry,
        results_tx: mpsc::Sender<QueueResults>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            repo,
            config,
            scheduler,
            limiter,
            extensions,
            results_tx,
            shutdown_rx,
            coordinators: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn coordinator_count(&self) -> usize {
        self.coordinators.lock().unwrap().len()
    }

    /// Wake (or start) the coordinator for this (step, batch key) pair.
    pub async fn notify(&self, step_id: &str, batch_key: &str) {
        let key = (step_id.to_string(), batch_key.to_string());
        let mut coordinators = self.coordinators.lock().unwrap();
        // Idle coordinators exit on their own; reap before reuse.
        if let Some(entry) = coordinators.get(&key) {
            if entry.handle.is_finished() {
                coordinators.remove(&key);
            }
        }
        if let Some(entry) = coordinators.get(&key) {
            entry.notify.notify_one();
            return;
        }

        let notify = Arc::new(Notify::new());
        notify.notify_one();
        let coordinator = BatchCoordinator {
            tenant_id: self.tenant_id.clone(),
            step_id: step_id.to_string(),
            batch_key: batch_key.to_string(),
            repo: Arc::clone(&self.repo),
            config: Arc::clone(&self.config),
            scheduler: Arc::clone(&self.scheduler),
            limiter: Arc::clone(&self.limiter),
            extensions: self.extensions.clone(),
            results_tx: self.results_tx.clone(),
            notify: Arc::clone(&notify),
        };
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(coordinator.run(shutdown_rx));
        coordinators.insert(key, CoordinatorHandle { notify, handle });
    }

    /// Stop every coordinator and wait for them to exit. Buffered items stay
    /// in storage; a later replica picks them up from its own cursor.
    pub async fn cleanup(&self) {
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut coordinators = self.coordinators.lock().unwrap();
            coordinators.drain().map(|(_, e)| e.handle).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

struct BatchCoordinator {
    tenant_id: String,
    step_id: String,
    batch_key: String,
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    scheduler: Arc<Scheduler>,
    limiter: Arc<RateLimiter>,
    extensions: ExtensionRegistry,
    results_tx: mpsc::Sender<QueueResults>,
    notify: Arc<Notify>,
}

impl BatchCoordinator {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.batch_poll_interval_ms);
        let idle_ttl = self.config.batch_idle_ttl_ms as i64;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut buffer: Vec<QueueItem> = Vec::new();
        let mut after_id: i64 = 0;
        let mut first_buffered_at_ms: Option<i64> = None;
        let mut last_activity_ms = now_epoch_ms();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(err) = self
                .cycle(
                    &mut buffer,
                    &mut after_id,
                    &mut first_buffered_at_ms,
                    &mut last_activity_ms,
                )
                .await
            {
                warn!(
                    tenant = %self.tenant_id,
                    step = %self.step_id,
                    batch_key = %self.batch_key,
                    error = %err,
                    "batch cycle failed"
                );
            }

            if buffer.is_empty() && now_epoch_ms() - last_activity_ms >= idle_ttl {
                debug!(
                    tenant = %self.tenant_id,
                    step = %self.step_id,
                    batch_key = %self.batch_key,
                    "batch coordinator idle, stopping"
                );
                break;
            }
        }
    }

    async fn cycle(
        &self,
        buffer: &mut Vec<QueueItem>,
        after_id: &mut i64,
        first_buffered_at_ms: &mut Option<i64>,
        last_activity_ms: &mut i64,
    ) -> Result<(), RepositoryError> {
        // Pull new items past the cursor. The cursor only moves forward;
        // items that fail to flush stay in the local buffer, not in storage
        // reads.
        let pulled = self
            .repo
            .list_batched_queue_items(
                &self.tenant_id,
                &self.step_id,
                &self.batch_key,
                *after_id,
                self.config.batch_pull_limit,
            )
            .await?;
        if !pulled.is_empty() {
            if let Some(max_id) = pulled.iter().map(|i| i.id).max() {
                *after_id = max_id;
            }
            if first_buffered_at_ms.is_none() {
                *first_buffered_at_ms = Some(now_epoch_ms());
            }
            buffer.extend(pulled);
            *last_activity_ms = now_epoch_ms();
        }

        self.expire_timed_out(buffer).await?;

        let config = match self.repo.get_batch_config(&self.tenant_id, &self.step_id).await? {
            Some(config) => config,
            // No configuration yet: hold the buffer and retry. The config
            // row is written when the step is registered, so this window is
            // short.
            None => return Ok(()),
        };
        let batch_size = config.batch_size.max(1);

        while buffer.len() >= batch_size {
            let group: Vec<QueueItem> = buffer.drain(..batch_size).collect();
            if !self
                .flush(group, BatchFlushReason::SizeReached, &config, buffer)
                .await?
            {
                return Ok(());
            }
            *last_activity_ms = now_epoch_ms();
            *first_buffered_at_ms = if buffer.is_empty() {
                None
            } else {
                Some(now_epoch_ms())
            };
        }

        let interval_elapsed = first_buffered_at_ms
            .map(|t| now_epoch_ms() - t >= config.flush_interval_ms as i64)
            .unwrap_or(false);
        if !buffer.is_empty() && interval_elapsed {
            let group: Vec<QueueItem> = std::mem::take(buffer);
            if self
                .flush(group, BatchFlushReason::IntervalElapsed, &config, buffer)
                .await?
            {
                *last_activity_ms = now_epoch_ms();
                *first_buffered_at_ms = None;
            }
        }
        Ok(())
    }

    /// Report and delete buffered items whose scheduling deadline passed.
    /// Timed-out items are never silently dropped from a batch.
    async fn expire_timed_out(&self, buffer: &mut Vec<QueueItem>) -> Result<(), RepositoryError> {
        let now = now_epoch_ms();
        if !buffer.iter().any(|i| i.timed_out(now)) {
            return Ok(());
        }
        let (timed_out, live): (Vec<QueueItem>, Vec<QueueItem>) =
            std::mem::take(buffer).into_iter().partition(|i| i.timed_out(now));
        *buffer = live;

        let ids: Vec<i64> = timed_out.iter().map(|i| i.id).collect();
        if let Err(err) = self
            .repo
            .delete_batched_queue_items(&self.tenant_id, &ids)
            .await
        {
            // Deadline items are only reported once deleted; keep them
            // buffered so a later cycle can still report them.
            let mut restored = timed_out;
            restored.extend(std::mem::take(buffer));
            *buffer = restored;
            return Err(err);
        }
        self.publish(QueueResults {
            tenant_id: self.tenant_id.clone(),
            queue: timed_out
                .first()
                .map(|i| i.queue.clone())
                .unwrap_or_default(),
            assigned: Vec::new(),
            unassigned: Vec::new(),
            scheduling_timed_out: timed_out,
            rate_limited: Vec::new(),
        })
        .await;
        Ok(())
    }

    /// Commit one buffered group against a single slot. Returns false when
    /// the group was put back and flushing should pause until the next
    /// cycle.
    async fn flush(
        &self,
        group: Vec<QueueItem>,
        reason: BatchFlushReason,
        config: &BatchConfig,
        buffer: &mut Vec<QueueItem>,
    ) -> Result<bool, RepositoryError> {
        if let Some(max_runs) = config.max_runs {
            // The read cursor has already moved past this group, so any
            // error below must put it back intact or it is lost for the
            // life of the coordinator.
            let active = match self
                .repo
                .count_active_batch_runs(&self.tenant_id, &self.step_id)
                .await
            {
                Ok(active) => active,
                Err(err) => {
                    Self::requeue(buffer, group);
                    return Err(err);
                }
            };
            if active >= max_runs as i64 {
                debug!(
                    tenant = %self.tenant_id,
                    step = %self.step_id,
                    active,
                    max_runs,
                    "batch run limit reached, holding"
                );
                Self::requeue(buffer, group);
                return Ok(false);
            }
        }

        // Items can be cancelled between buffering and flush; drop the ones
        // storage no longer has.
        let ids: Vec<i64> = group.iter().map(|i| i.id).collect();
        let existing = match self
            .repo
            .list_existing_batch_item_ids(&self.tenant_id, &ids)
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                Self::requeue(buffer, group);
                return Err(err);
            }
        };
        let existing: std::collections::HashSet<i64> = existing.into_iter().collect();
        let group: Vec<QueueItem> = group
            .into_iter()
            .filter(|i| existing.contains(&i.id))
            .collect();
        let Some(representative) = group.first().cloned() else {
            return Ok(true);
        };

        // A group whose queue name resolves to no queue kind cannot be
        // dispatched. Put it back rather than dropping it; the warning
        // repeats each cycle until an operator fixes the item.
        if QueueId::parse(&representative.queue).is_none() {
            warn!(
                tenant = %self.tenant_id,
                step = %self.step_id,
                queue = %representative.queue,
                "batch group names an unresolvable queue, requeueing"
            );
            Self::requeue(buffer, group);
            return Ok(false);
        }

        let labels = match self
            .repo
            .get_desired_labels(&self.tenant_id, std::slice::from_ref(&self.step_id))
            .await
        {
            Ok(labels) => labels,
            Err(err) => {
                Self::requeue(buffer, group);
                return Err(err);
            }
        };
        let rate_limits = match self
            .repo
            .get_task_rate_limits(&self.tenant_id, std::slice::from_ref(&representative))
            .await
        {
            Ok(limits) => limits,
            Err(err) => {
                Self::requeue(buffer, group);
                return Err(err);
            }
        };

        // The whole group rides on one slot, claimed via the representative.
        let offset = self.scheduler.ring_offset(&representative.action_id);
        let (mut results, new_offset) = self
            .scheduler
            .try_assign_batch(
                &representative.action_id.clone(),
                vec![representative],
                offset,
                &labels,
                &rate_limits,
                &self.limiter,
            )
            .await;
        self.scheduler
            .set_ring_offset(&group[0].action_id, new_offset);

        let (ack_id, worker_id) = match results.pop() {
            Some(AssignResult::Assigned {
                ack_id, worker_id, ..
            }) => (ack_id, worker_id),
            _ => {
                Self::requeue(buffer, group);
                return Ok(false);
            }
        };

        let batch_id = uuid::Uuid::new_v4().to_string();
        match storage_call(
            self.config.storage_timeout_ms,
            self.repo
                .commit_batch_assignments(&self.tenant_id, &worker_id, &batch_id, &group),
        )
        .await
        {
            Ok(()) => {
                self.scheduler.ack(&[ack_id]);
                let ids: Vec<i64> = group.iter().map(|i| i.id).collect();
                if let Err(err) = self
                    .repo
                    .delete_batched_queue_items(&self.tenant_id, &ids)
                    .await
                {
                    // The assignment committed; the leftover rows are
                    // deduplicated by the existence check on a later flush.
                    warn!(
                        tenant = %self.tenant_id,
                        step = %self.step_id,
                        error = %err,
                        "batched item cleanup failed"
                    );
                }
                let pending = buffer.len();
                let queue = group[0].queue.clone();
                let assigned: Vec<AssignedItem> = group
                    .into_iter()
                    .map(|item| AssignedItem {
                        worker_id: worker_id.clone(),
                        queue_item: item,
                        batch: Some(BatchMetadata {
                            batch_id: batch_id.clone(),
                            reason,
                            configured_size: config.batch_size,
                            configured_interval_ms: config.flush_interval_ms,
                            pending_count: pending,
                        }),
                    })
                    .collect();
                self.publish(QueueResults {
                    tenant_id: self.tenant_id.clone(),
                    queue,
                    assigned,
                    unassigned: Vec::new(),
                    scheduling_timed_out: Vec::new(),
                    rate_limited: Vec::new(),
                })
                .await;
                Ok(true)
            }
            Err(err) => {
                warn!(
                    tenant = %self.tenant_id,
                    step = %self.step_id,
                    batch_key = %self.batch_key,
                    error = %err,
                    "batch commit failed, requeueing group"
                );
                self.scheduler.nack(&[ack_id]);
                Self::requeue(buffer, group);
                Ok(false)
            }
        }
    }

    fn requeue(buffer: &mut Vec<QueueItem>, group: Vec<QueueItem>) {
        // Requeued items go back in front so order is preserved.
        let mut restored = group;
        restored.extend(std::mem::take(buffer));
        *buffer = restored;
    }

    async fn publish(&self, results: QueueResults) {
        if results.is_empty() {
            return;
        }
        self.extensions.post_assign(&results);
        if self.results_tx.send(results).await.is_err() {
            debug!(
                tenant = %self.tenant_id,
                step = %self.step_id,
                "results receiver dropped"
            );
        }
    }
}
