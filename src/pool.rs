//! The multi-tenant entry point.
//!
//! A scheduling pool owns one tenant manager per active tenant and two
//! outbound channels: queue results (assignments, timeouts, rate limits)
//! and concurrency results (queued and cancelled runs). The host drives the
//! pool with `set_tenants` and the notify methods, and consumes the
//! receivers it takes at startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::extensions::ExtensionRegistry;
use crate::repository::SchedulerRepository;
use crate::settings::SchedulingConfig;
use crate::tenant::TenantManager;
use crate::types::{ConcurrencyResults, QueueResults, Tenant};

pub struct SchedulingPool {
    repo: Arc<dyn SchedulerRepository>,
    config: Arc<SchedulingConfig>,
    extensions: ExtensionRegistry,
    tenants: tokio::sync::Mutex<HashMap<String, Arc<TenantManager>>>,
    results_tx: mpsc::Sender<QueueResults>,
    results_rx: Mutex<Option<mpsc::Receiver<QueueResults>>>,
    concurrency_results_tx: mpsc::Sender<ConcurrencyResults>,
    concurrency_results_rx: Mutex<Option<mpsc::Receiver<ConcurrencyResults>>>,
}

impl SchedulingPool {
    pub fn new(repo: Arc<dyn SchedulerRepository>, config: SchedulingConfig) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::channel(config.results_channel_capacity);
        let (concurrency_results_tx, concurrency_results_rx) =
            mpsc::channel(config.results_channel_capacity);
        Arc::new(Self {
            repo,
            config: Arc::new(config),
            extensions: ExtensionRegistry::new(),
            tenants: tokio::sync::Mutex::new(HashMap::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            concurrency_results_tx,
            concurrency_results_rx: Mutex::new(Some(concurrency_results_rx)),
        })
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn register_extension(&self, extension: Arc<dyn crate::extensions::Extension>) {
        self.extensions.register(extension);
    }

    /// Take the queue results receiver. Callable once; the pool blocks on
    /// this channel when it fills, so the host must drain it.
    pub fn take_results_rx(&self) -> Option<mpsc::Receiver<QueueResults>> {
        self.results_rx.lock().unwrap().take()
    }

    /// Take the concurrency results receiver. Callable once.
    pub fn take_concurrency_results_rx(&self) -> Option<mpsc::Receiver<ConcurrencyResults>> {
        self.concurrency_results_rx.lock().unwrap().take()
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.lock().await.len()
    }

    /// Reconcile the managed tenant set. Removed tenants are fully cleaned
    /// up (loops stopped, leases released) before their managers drop; kept
    /// tenants are untouched; new tenants start immediately.
    pub async fn set_tenants(&self, tenants: Vec<Tenant>) {
        let mut managed = self.tenants.lock().await;

        let keep: HashMap<&str, &Tenant> =
            tenants.iter().map(|t| (t.id.as_str(), t)).collect();
        let gone: Vec<String> = managed
            .keys()
            .filter(|id| !keep.contains_key(id.as_str()))
            .cloned()
            .collect();
        // Removed tenants wind down concurrently; each still finishes its
        // full cleanup (loops stopped, leases released) before we return.
        let mut removals = JoinSet::new();
        for tenant_id in gone {
            if let Some(manager) = managed.remove(&tenant_id) {
                info!(tenant = %tenant_id, "tenant removed from pool");
                removals.spawn(async move { manager.cleanup().await });
            }
        }
        while removals.join_next().await.is_some() {}

        for tenant in tenants {
            if managed.contains_key(&tenant.id) {
                continue;
            }
            info!(tenant = %tenant.id, "tenant added to pool");
            let manager = TenantManager::new(
                tenant.id.clone(),
                Arc::clone(&self.repo),
                Arc::clone(&self.config),
                self.extensions.clone(),
                self.results_tx.clone(),
                self.concurrency_results_tx.clone(),
            );
            managed.insert(tenant.id, manager);
        }
    }

    /// Request an early pull for one tenant queue, typically on enqueue.
    pub async fn notify_queue(&self, tenant_id: &str, queue: &str) {
        if let Some(manager) = self.tenants.lock().await.get(tenant_id) {
            manager.notify_queue(queue);
        }
    }

    /// Request an early pull for every queue a tenant's replica holds.
    pub async fn notify_queues(&self, tenant_id: &str) {
        if let Some(manager) = self.tenants.lock().await.get(tenant_id) {
            manager.notify_queues();
        }
    }

    /// Force an immediate slot-pool refresh for one tenant, typically after
    /// a worker connects or reports new capacity.
    pub async fn replenish(&self, tenant_id: &str) {
        let manager = self.tenants.lock().await.get(tenant_id).cloned();
        if let Some(manager) = manager {
            if let Err(error) = manager.scheduler().replenish(true).await {
                tracing::warn!(tenant = tenant_id, %error, "forced replenish failed");
            }
        }
    }

    /// Wake a concurrency strategy runner, typically when a run finishes.
    pub async fn notify_strategy(&self, tenant_id: &str, strategy_id: i64) {
        let manager = self.tenants.lock().await.get(tenant_id).cloned();
        if let Some(manager) = manager {
            manager.notify_strategy(strategy_id).await;
        }
    }

    /// Wake every strategy runner a tenant's replica holds.
    pub async fn notify_strategies(&self, tenant_id: &str) {
        if let Some(manager) = self.tenants.lock().await.get(tenant_id) {
            manager.notify_strategies();
        }
    }

    /// Stop every tenant and run extension cleanup.
    pub async fn cleanup(&self) {
        let managers: Vec<Arc<TenantManager>> = {
            let mut managed = self.tenants.lock().await;
            managed.drain().map(|(_, m)| m).collect()
        };
        let mut stops = JoinSet::new();
        for manager in managers {
            stops.spawn(async move { manager.cleanup().await });
        }
        while stops.join_next().await.is_some() {}
        self.extensions.cleanup();
    }
}
