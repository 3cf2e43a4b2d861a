//! Concurrency strategy evaluation.
//!
//! Each active strategy gets its own runner task that periodically asks
//! storage to re-evaluate the strategy (promote queued runs, cancel running
//! ones, per the strategy kind) and publishes any state changes. Runners
//! also wake on demand when new work arrives for their step, with wakeups
//! coalesced so a burst of arrivals costs one evaluation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::repository::SchedulerRepository;
use crate::settings::SchedulingConfig;
use crate::types::{now_epoch_ms, ConcurrencyResults, ConcurrencyStrategyRow};

struct StrategyRunner {
    tenant_id: String,
    row: ConcurrencyStrategyRow,
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    results_tx: mpsc::Sender<ConcurrencyResults>,
    notify: Notify,
}

impl StrategyRunner {
    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.concurrency_poll_interval_ms);
        let refresh_ms = self.config.concurrency_active_refresh_ms as i64;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_active_check = now_epoch_ms();
        let mut active = self.row.is_active;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = stop_rx.changed() => {}
            }
            if *stop_rx.borrow() {
                break;
            }

            // Strategies deactivate when their workflow completes; poll the
            // flag on a slow cadence instead of every evaluation.
            let now = now_epoch_ms();
            if now - last_active_check >= refresh_ms {
                last_active_check = now;
                match self
                    .repo
                    .update_strategy_active(&self.tenant_id, self.row.id)
                    .await
                {
                    Ok(is_active) => active = is_active,
                    Err(err) => {
                        warn!(
                            tenant = %self.tenant_id,
                            strategy = self.row.id,
                            error = %err,
                            "active check failed"
                        );
                    }
                }
            }
            if !active {
                continue;
            }

            match self
                .repo
                .run_concurrency_strategy(&self.tenant_id, &self.row)
                .await
            {
                Ok(results) => {
                    if results.queued_run_ids.is_empty() && results.cancelled_run_ids.is_empty() {
                        continue;
                    }
                    // Results must be delivered; block rather than drop.
                    if self.results_tx.send(results).await.is_err() {
                        debug!(
                            tenant = %self.tenant_id,
                            strategy = self.row.id,
                            "concurrency results receiver dropped"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        tenant = %self.tenant_id,
                        strategy = self.row.id,
                        error = %err,
                        "strategy evaluation failed"
                    );
                }
            }
        }
        debug!(tenant = %self.tenant_id, strategy = self.row.id, "strategy runner stopped");
    }
}

struct RunnerHandle {
    runner: Arc<StrategyRunner>,
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Child lookups hit storage once per parent and are cached after that;
/// step-to-strategy mappings are filled in as leases arrive. Both maps are
/// bounded so tenants with churning workflows cannot grow them forever.
struct StrategyIndex {
    children: Mutex<LruCache<i64, Vec<i64>>>,
    by_step: Mutex<LruCache<String, i64>>,
}

impl StrategyIndex {
    fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            children: Mutex::new(LruCache::new(capacity)),
            by_step: Mutex::new(LruCache::new(capacity)),
        }
    }
}

pub struct ConcurrencyManager {
    tenant_id: String,
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    results_tx: mpsc::Sender<ConcurrencyResults>,
    shutdown_rx: watch::Receiver<bool>,
    runners: Mutex<HashMap<i64, RunnerHandle>>,
    index: StrategyIndex,
}

impl ConcurrencyManager {
    pub fn new(
        tenant_id: impl Into<String>,
        repo: Arc<dyn SchedulerRepository>,
        config: Arc<SchedulingConfig>,
        results_tx: mpsc::Sender<ConcurrencyResults>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let cache_size = config.strategy_cache_size;
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            repo,
            config,
            results_tx,
            shutdown_rx,
            runners: Mutex::new(HashMap::new()),
            index: StrategyIndex::new(cache_size),
        })
    }

    pub fn runner_count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }

    /// Reconcile the runner set against the strategies this replica holds
    /// leases for. Existing runners for retained strategies are untouched;
    /// dropped ones are stopped, new ones started.
    pub fn set_strategies(&self, rows: Vec<ConcurrencyStrategyRow>) {
        let mut stopped = Vec::new();
        {
            let mut runners = self.runners.lock().unwrap();
            let keep: HashMap<i64, &ConcurrencyStrategyRow> =
                rows.iter().map(|r| (r.id, r)).collect();
            let gone: Vec<i64> = runners
                .keys()
                .filter(|id| !keep.contains_key(id))
                .copied()
                .collect();
            for id in gone {
                if let Some(entry) = runners.remove(&id) {
                    let _ = entry.stop_tx.send(true);
                    stopped.push(entry.handle);
                }
            }
            for row in rows {
                self.index
                    .by_step
                    .lock()
                    .unwrap()
                    .put(row.step_id.clone(), row.id);
                if runners.contains_key(&row.id) {
                    continue;
                }
                let id = row.id;
                let runner = Arc::new(StrategyRunner {
                    tenant_id: self.tenant_id.clone(),
                    row,
                    repo: Arc::clone(&self.repo),
                    config: Arc::clone(&self.config),
                    results_tx: self.results_tx.clone(),
                    notify: Notify::new(),
                });
                let (stop_tx, stop_rx) = watch::channel(false);
                let mut shutdown_rx = self.shutdown_rx.clone();
                let task_runner = Arc::clone(&runner);
                let task_stop = stop_tx.clone();
                let handle = tokio::spawn(async move {
                    // Fold the global shutdown into the per-runner stop so
                    // the loop watches a single channel.
                    let forward = tokio::spawn(async move {
                        if shutdown_rx.changed().await.is_ok() && *shutdown_rx.borrow() {
                            let _ = task_stop.send(true);
                        }
                    });
                    task_runner.run(stop_rx).await;
                    forward.abort();
                });
                runners.insert(id, RunnerHandle {
                    runner,
                    stop_tx,
                    handle,
                });
            }
        }
        // Stopped runners wind down on their own; nothing to await here.
        drop(stopped);
    }

    /// Wake the runner owning `step_id`'s strategy, resolved through the
    /// step index. Steps this replica has never seen a lease for are
    /// ignored.
    pub async fn notify_step(&self, step_id: &str) {
        let id = self.index.by_step.lock().unwrap().get(step_id).copied();
        if let Some(id) = id {
            self.notify(id).await;
        }
    }

    /// Wake every runner this replica currently holds.
    pub fn notify_all(&self) {
        let runners = self.runners.lock().unwrap();
        for entry in runners.values() {
            entry.runner.notify.notify_one();
        }
    }

    /// Wake the runner for `strategy_id`, and the runners of its child
    /// strategies. Children are resolved from storage the first time and
    /// cached after that.
    pub async fn notify(&self, strategy_id: i64) {
        {
            let runners = self.runners.lock().unwrap();
            if let Some(entry) = runners.get(&strategy_id) {
                entry.runner.notify.notify_one();
            }
        }

        let cached = self
            .index
            .children
            .lock()
            .unwrap()
            .get(&strategy_id)
            .cloned();
        let child_ids = match cached {
            Some(ids) => ids,
            None => match self
                .repo
                .list_child_strategies(&self.tenant_id, strategy_id)
                .await
            {
                Ok(children) => {
                    let ids: Vec<i64> = children.iter().map(|c| c.id).collect();
                    self.index
                        .children
                        .lock()
                        .unwrap()
                        .put(strategy_id, ids.clone());
                    ids
                }
                Err(err) => {
                    warn!(
                        tenant = %self.tenant_id,
                        strategy = strategy_id,
                        error = %err,
                        "child strategy lookup failed"
                    );
                    Vec::new()
                }
            },
        };

        let runners = self.runners.lock().unwrap();
        for id in child_ids {
            if let Some(entry) = runners.get(&id) {
                entry.runner.notify.notify_one();
            }
        }
    }

    /// Stop every runner and wait for the tasks to exit.
    pub async fn cleanup(&self) {
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut runners = self.runners.lock().unwrap();
            runners
                .drain()
                .map(|(_, entry)| {
                    let _ = entry.stop_tx.send(true);
                    entry.handle
                })
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
