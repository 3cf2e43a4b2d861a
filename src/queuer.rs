//! Per-queue pull/assign/flush loop.
//!
//! A queuer owns one (tenant, queue) pair under a queue lease. Each cycle it
//! refills its local buffer from storage, offers the buffered items to the
//! scheduler, and flushes the decisions back. Items the scheduler could not
//! place stay buffered and are re-offered on the next cycle.
//!
//! Refill is hybrid: a cycle pulls from storage when the buffer has room or
//! when the last pull is stale, so a wedged flush cannot starve the queue
//! forever but a hot queue is not hammered with redundant reads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::batch::BatchRegistry;
use crate::extensions::ExtensionRegistry;
use crate::rate_limiter::RateLimiter;
use crate::repository::{storage_call, AssignmentFlush, FlushAssigned, SchedulerRepository};
use crate::scheduler::{AssignResult, Scheduler};
use crate::settings::SchedulingConfig;
use crate::types::{now_epoch_ms, AssignedItem, QueueId, QueueItem, QueueResults, RateLimitedItem};

pub struct Queuer {
    tenant_id: String,
    queue: QueueId,
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    scheduler: Arc<Scheduler>,
    limiter: Arc<RateLimiter>,
    batches: Arc<BatchRegistry>,
    extensions: ExtensionRegistry,
    results_tx: mpsc::Sender<QueueResults>,
    notify: Notify,

    // Buffered items not yet offered, keyed by item id.
    unassigned: Mutex<HashMap<i64, QueueItem>>,
    // Item ids currently assigned or mid-flush. Refill skips these so a
    // storage read that races a flush cannot re-buffer an item in flight.
    in_flight: Mutex<HashSet<i64>>,
    last_refill_ms: AtomicI64,
}

impl Queuer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        queue: QueueId,
        repo: Arc<dyn SchedulerRepository>,
        config: Arc<SchedulingConfig>,
        scheduler: Arc<Scheduler>,
        limiter: Arc<RateLimiter>,
        batches: Arc<BatchRegistry>,
        extensions: ExtensionRegistry,
        results_tx: mpsc::Sender<QueueResults>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            queue,
            repo,
            config,
            scheduler,
            limiter,
            batches,
            extensions,
            results_tx,
            notify: Notify::new(),
            unassigned: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            last_refill_ms: AtomicI64::new(0),
        })
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    /// Request an early cycle. Wakeups coalesce; notifying an already
    /// notified queuer is a no-op.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn buffered_count(&self) -> usize {
        self.unassigned.lock().unwrap().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Run cycles until shutdown. Ticks on the poll interval and on
    /// notifications, whichever comes first.
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let queuer = Arc::clone(self);
        let interval = Duration::from_millis(queuer.config.queue_poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = queuer.notify.notified() => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                if let Err(err) = queuer.cycle().await {
                    warn!(
                        tenant = %queuer.tenant_id,
                        queue = %queuer.queue,
                        error = %err,
                        "queue cycle failed"
                    );
                }
            }
            debug!(tenant = %queuer.tenant_id, queue = %queuer.queue, "queuer stopped");
        })
    }

    async fn cycle(self: &Arc<Self>) -> Result<(), crate::repository::RepositoryError> {
        let pulled_full = self.maybe_refill().await?;

        let mut items: Vec<QueueItem> = {
            let mut unassigned = self.unassigned.lock().unwrap();
            let mut in_flight = self.in_flight.lock().unwrap();
            let drained: Vec<QueueItem> = unassigned.drain().map(|(_, item)| item).collect();
            for item in &drained {
                in_flight.insert(item.id);
            }
            drained
        };
        if items.is_empty() {
            return Ok(());
        }

        // Higher priority first; within a priority, oldest first.
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let step_ids: Vec<String> = {
            let mut seen = HashSet::new();
            items
                .iter()
                .filter(|i| seen.insert(i.step_id.clone()))
                .map(|i| i.step_id.clone())
                .collect()
        };
        // Drained items are back in the buffer before an error propagates,
        // otherwise their ids would sit in `in_flight` forever and refill
        // would skip them for the life of the queuer.
        let labels = match self.repo.get_desired_labels(&self.tenant_id, &step_ids).await {
            Ok(labels) => labels,
            Err(err) => {
                self.requeue(items);
                return Err(err);
            }
        };
        let rate_limits = match self.repo.get_task_rate_limits(&self.tenant_id, &items).await {
            Ok(limits) => limits,
            Err(err) => {
                self.requeue(items);
                return Err(err);
            }
        };

        let offered = items.len();
        let mut rx = self.scheduler.try_assign(
            items,
            labels,
            rate_limits,
            Arc::clone(&self.limiter),
        );

        // Flushes run concurrently with later assignment batches but are all
        // awaited before the cycle ends, so shutdown never abandons one.
        let mut flushes = JoinSet::new();
        let mut placed = 0usize;
        while let Some(batch) = rx.recv().await {
            placed += batch
                .results
                .iter()
                .filter(|r| matches!(r, AssignResult::Assigned { .. }))
                .count();
            let queuer = Arc::clone(self);
            flushes.spawn(async move {
                queuer.flush_batch(batch.results).await;
            });
        }
        while flushes.join_next().await.is_some() {}

        // A full pull that all found slots usually means more is waiting.
        if pulled_full && placed == offered {
            self.notify();
        }
        Ok(())
    }

    /// Pull fresh items from storage when the buffer has drained or the
    /// last pull has gone stale. Returns whether a full page came back.
    async fn maybe_refill(&self) -> Result<bool, crate::repository::RepositoryError> {
        let now = now_epoch_ms();
        let stale = now - self.last_refill_ms.load(Ordering::Acquire)
            >= self.config.queue_refill_stale_ms as i64;
        let below_limit = self.in_flight.lock().unwrap().len() < self.config.queue_pull_limit;
        if !stale && !below_limit {
            return Ok(false);
        }

        let pulled = self
            .repo
            .list_queue_items(&self.tenant_id, &self.queue.name(), self.config.queue_pull_limit)
            .await?;
        self.last_refill_ms.store(now_epoch_ms(), Ordering::Release);
        let pulled_full = pulled.len() >= self.config.queue_pull_limit;

        let mut batched = Vec::new();
        {
            let mut unassigned = self.unassigned.lock().unwrap();
            let in_flight = self.in_flight.lock().unwrap();
            for item in pulled {
                if in_flight.contains(&item.id) || unassigned.contains_key(&item.id) {
                    continue;
                }
                // Batched items never go through direct assignment; the
                // batch scheduler pulls them by its own cursor.
                if let Some(batch_key) = &item.batch_key {
                    batched.push((item.step_id.clone(), batch_key.clone()));
                    continue;
                }
                unassigned.insert(item.id, item);
            }
        }
        for (step_id, batch_key) in batched {
            self.batches.notify(&step_id, &batch_key).await;
        }
        Ok(pulled_full)
    }

    /// Write one batch of assignment decisions back to storage and publish
    /// the results. Every ack id ends in exactly one of ack or nack.
    async fn flush_batch(&self, results: Vec<AssignResult>) {
        let mut assigned: Vec<FlushAssigned> = Vec::new();
        let mut unassigned: Vec<QueueItem> = Vec::new();
        let mut scheduling_timed_out: Vec<QueueItem> = Vec::new();
        let mut rate_limited: Vec<RateLimitedItem> = Vec::new();

        for result in results {
            match result {
                AssignResult::Assigned {
                    ack_id,
                    worker_id,
                    item,
                } => assigned.push(FlushAssigned {
                    ack_id,
                    worker_id,
                    item,
                }),
                AssignResult::NoSlots { item } => unassigned.push(item),
                AssignResult::SchedulingTimedOut { item } => scheduling_timed_out.push(item),
                AssignResult::RateLimited {
                    item,
                    key,
                    units,
                    capacity,
                } => rate_limited.push(RateLimitedItem {
                    queue_item: item,
                    exceeded_key: key,
                    exceeded_units: units,
                    exceeded_capacity: capacity,
                }),
            }
        }

        let flush = AssignmentFlush {
            queue: self.queue.name(),
            assigned,
            unassigned,
            scheduling_timed_out,
        };

        let mut results = QueueResults {
            tenant_id: self.tenant_id.clone(),
            queue: self.queue.name(),
            assigned: Vec::new(),
            unassigned: Vec::new(),
            scheduling_timed_out: Vec::new(),
            rate_limited,
        };

        match storage_call(
            self.config.storage_timeout_ms,
            self.repo.mark_queue_items_processed(&self.tenant_id, &flush),
        )
        .await
        {
            Ok(marked) => {
                let failed: HashSet<i64> = marked.failed.iter().copied().collect();
                let mut ack_ids = Vec::new();
                let mut nack_ids = Vec::new();
                let mut requeue = Vec::new();
                for entry in flush.assigned {
                    if failed.contains(&entry.item.id) {
                        nack_ids.push(entry.ack_id);
                        requeue.push(entry.item);
                    } else {
                        ack_ids.push(entry.ack_id);
                        results.assigned.push(AssignedItem {
                            worker_id: entry.worker_id,
                            queue_item: entry.item,
                            batch: None,
                        });
                    }
                }
                self.scheduler.ack(&ack_ids);
                self.scheduler.nack(&nack_ids);
                self.requeue(requeue);
                self.finish(results.assigned.iter().map(|a| a.queue_item.id));
                results.unassigned = flush.unassigned.clone();
                self.requeue(flush.unassigned);
                self.finish(flush.scheduling_timed_out.iter().map(|i| i.id));
                results.scheduling_timed_out = flush.scheduling_timed_out;
                let retry: Vec<QueueItem> = results
                    .rate_limited
                    .iter()
                    .map(|r| r.queue_item.clone())
                    .collect();
                self.requeue(retry);
            }
            Err(err) => {
                warn!(
                    tenant = %self.tenant_id,
                    queue = %self.queue,
                    error = %err,
                    "flush failed; releasing slots"
                );
                let ack_ids: Vec<u64> = flush.assigned.iter().map(|a| a.ack_id).collect();
                self.scheduler.nack(&ack_ids);
                let mut requeue: Vec<QueueItem> =
                    flush.assigned.into_iter().map(|a| a.item).collect();
                requeue.extend(flush.unassigned);
                requeue.extend(flush.scheduling_timed_out);
                for r in results.rate_limited.drain(..) {
                    requeue.push(r.queue_item);
                }
                self.requeue(requeue);
                return;
            }
        }

        if !results.is_empty() {
            self.extensions.post_assign(&results);
            // Blocking send: results must not be dropped, unlike wakeups.
            if self.results_tx.send(results).await.is_err() {
                debug!(
                    tenant = %self.tenant_id,
                    queue = %self.queue,
                    "results receiver dropped"
                );
            }
        }
    }

    /// Put items back in the buffer for the next cycle.
    fn requeue(&self, items: Vec<QueueItem>) {
        if items.is_empty() {
            return;
        }
        let mut unassigned = self.unassigned.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        for item in items {
            in_flight.remove(&item.id);
            unassigned.insert(item.id, item);
        }
    }

    /// Items that left the queue for good (assigned or timed out).
    fn finish(&self, ids: impl Iterator<Item = i64>) {
        let mut in_flight = self.in_flight.lock().unwrap();
        for id in ids {
            in_flight.remove(&id);
        }
    }
}
