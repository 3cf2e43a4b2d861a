//! Per-tenant engine assembly.
//!
//! A tenant manager wires one tenant's scheduler, lease manager, rate
//! limiter, queuers, concurrency runners, and batch coordinators together
//! and reconciles the running set against lease updates: workers feed the
//! slot pool, queue leases start and stop queuers, strategy leases start
//! and stop concurrency runners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::batch::BatchRegistry;
use crate::concurrency::ConcurrencyManager;
use crate::extensions::ExtensionRegistry;
use crate::lease_manager::{LeaseManager, LeaseReceivers};
use crate::queuer::Queuer;
use crate::rate_limiter::RateLimiter;
use crate::repository::SchedulerRepository;
use crate::scheduler::Scheduler;
use crate::settings::SchedulingConfig;
use crate::types::{ConcurrencyResults, QueueId, QueueResults};

struct QueuerHandle {
    queuer: Arc<Queuer>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct TenantManager {
    tenant_id: String,
    config: Arc<SchedulingConfig>,
    scheduler: Arc<Scheduler>,
    limiter: Arc<RateLimiter>,
    lease_manager: Arc<LeaseManager>,
    concurrency: Arc<ConcurrencyManager>,
    batches: Arc<BatchRegistry>,
    repo: Arc<dyn SchedulerRepository>,
    extensions: ExtensionRegistry,
    results_tx: mpsc::Sender<QueueResults>,
    queuers: Mutex<HashMap<String, QueuerHandle>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TenantManager {
    pub fn new(
        tenant_id: impl Into<String>,
        repo: Arc<dyn SchedulerRepository>,
        config: Arc<SchedulingConfig>,
        extensions: ExtensionRegistry,
        results_tx: mpsc::Sender<QueueResults>,
        concurrency_results_tx: mpsc::Sender<ConcurrencyResults>,
    ) -> Arc<Self> {
        let tenant_id = tenant_id.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            tenant_id.clone(),
            Arc::clone(&repo),
            (*config).clone(),
        );
        let limiter = RateLimiter::new(tenant_id.clone(), Arc::clone(&repo));
        let (lease_manager, receivers) = LeaseManager::new(
            tenant_id.clone(),
            Arc::clone(&repo),
            (*config).clone(),
        );
        let concurrency = ConcurrencyManager::new(
            tenant_id.clone(),
            Arc::clone(&repo),
            Arc::clone(&config),
            concurrency_results_tx,
            shutdown_rx,
        );
        let batches = BatchRegistry::new(
            tenant_id.clone(),
            Arc::clone(&repo),
            Arc::clone(&config),
            Arc::clone(&scheduler),
            Arc::clone(&limiter),
            extensions.clone(),
            results_tx.clone(),
            shutdown_tx.subscribe(),
        );

        let manager = Arc::new(Self {
            tenant_id,
            config,
            scheduler,
            limiter,
            lease_manager,
            concurrency,
            batches,
            repo,
            extensions,
            results_tx,
            queuers: Mutex::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        manager.spawn_loops(receivers);
        manager
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn queue_count(&self) -> usize {
        self.queuers.lock().unwrap().len()
    }

    fn spawn_loops(self: &Arc<Self>, receivers: LeaseReceivers) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(self.lease_manager.start(shutdown_rx.clone()));
        tasks.push(self.scheduler.spawn_replenish_loop(shutdown_rx.clone()));
        tasks.push(self.limiter.spawn_flush_loop(&self.config, shutdown_rx.clone()));
        tasks.push(self.spawn_reconcile_loop(receivers));
        tasks.push(self.spawn_snapshot_loop(shutdown_rx));
    }

    /// Apply lease updates as they arrive. Exits when the lease manager
    /// closes its channels during cleanup.
    fn spawn_reconcile_loop(self: &Arc<Self>, receivers: LeaseReceivers) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let LeaseReceivers {
            mut workers_rx,
            mut queues_rx,
            mut strategies_rx,
        } = receivers;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    workers = workers_rx.recv() => {
                        let Some(workers) = workers else { break };
                        debug!(
                            tenant = %manager.tenant_id,
                            workers = workers.len(),
                            "worker leases updated"
                        );
                        manager.scheduler.set_workers(workers);
                        if let Err(err) = manager.scheduler.replenish(true).await {
                            warn!(
                                tenant = %manager.tenant_id,
                                error = %err,
                                "replenish after worker update failed"
                            );
                        }
                    }
                    queues = queues_rx.recv() => {
                        let Some(queues) = queues else { break };
                        manager.set_queues(queues);
                    }
                    strategies = strategies_rx.recv() => {
                        let Some(strategies) = strategies else { break };
                        manager.concurrency.set_strategies(strategies);
                    }
                }
            }
            debug!(tenant = %manager.tenant_id, "reconcile loop stopped");
        })
    }

    fn spawn_snapshot_loop(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.replenish_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        let snapshot = manager.scheduler.snapshot();
                        manager.extensions.post_snapshot(&snapshot);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Diff the queuer set against the queues this replica now holds leases
    /// for. Kept queuers are untouched so their buffers survive the update.
    fn set_queues(self: &Arc<Self>, queues: Vec<String>) {
        let mut queuers = self.queuers.lock().unwrap();

        let keep: std::collections::HashSet<&String> = queues.iter().collect();
        let gone: Vec<String> = queuers
            .keys()
            .filter(|q| !keep.contains(q))
            .cloned()
            .collect();
        for queue in gone {
            if let Some(entry) = queuers.remove(&queue) {
                info!(tenant = %self.tenant_id, queue = %queue, "queue lease lost, stopping queuer");
                entry.handle.abort();
            }
        }

        for queue in queues {
            if queuers.contains_key(&queue) {
                continue;
            }
            let Some(queue_id) = QueueId::parse(&queue) else {
                warn!(tenant = %self.tenant_id, queue = %queue, "leased queue name resolves to no queue kind, ignoring");
                continue;
            };
            info!(tenant = %self.tenant_id, queue = %queue, "queue lease acquired, starting queuer");
            let queuer = Queuer::new(
                self.tenant_id.clone(),
                queue_id,
                Arc::clone(&self.repo),
                Arc::clone(&self.config),
                Arc::clone(&self.scheduler),
                Arc::clone(&self.limiter),
                Arc::clone(&self.batches),
                self.extensions.clone(),
                self.results_tx.clone(),
            );
            let handle = queuer.start(self.shutdown_tx.subscribe());
            queuers.insert(queue, QueuerHandle { queuer, handle });
        }
    }

    /// Request an early cycle for one queue. Unknown queues are ignored;
    /// the replica holding the lease will pick the work up on its own tick.
    pub fn notify_queue(&self, queue: &str) {
        if let Some(entry) = self.queuers.lock().unwrap().get(queue) {
            entry.queuer.notify();
        }
    }

    /// Request an early cycle for every queue this replica holds.
    pub fn notify_queues(&self) {
        for entry in self.queuers.lock().unwrap().values() {
            entry.queuer.notify();
        }
    }

    /// Wake the strategy runner (and its children) for `strategy_id`.
    pub async fn notify_strategy(&self, strategy_id: i64) {
        self.concurrency.notify(strategy_id).await;
    }

    /// Wake every strategy runner this replica holds.
    pub fn notify_strategies(&self) {
        self.concurrency.notify_all();
    }

    /// Stop all loops, wait for them, then release leases. Lease release
    /// runs last so another replica cannot double-schedule against slots
    /// this one is still flushing.
    pub async fn cleanup(&self) {
        info!(tenant = %self.tenant_id, "tenant manager shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<tokio::task::JoinHandle<()>> =
            self.tasks.lock().unwrap().drain(..).collect();

        self.concurrency.cleanup().await;
        self.batches.cleanup().await;

        let queuer_handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut queuers = self.queuers.lock().unwrap();
            queuers.drain().map(|(_, e)| e.handle).collect()
        };
        for handle in queuer_handles {
            let _ = handle.await;
        }

        // Lease cleanup closes the reconcile channels, letting that loop
        // exit before we await it.
        self.lease_manager.cleanup().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}
