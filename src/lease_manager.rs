//! Lease acquisition and renewal for the three partitioned resource kinds.
//!
//! Every tick, per kind: list current candidate resources from storage,
//! release leases for resources that vanished, then acquire-or-extend in a
//! single batched storage call (never one call per resource). The held
//! resource sets are published on bounded channels with drop-on-full sends:
//! the consumer only ever needs the latest set, and blocking here would
//! stall the refresh loop.
//!
//! Cleanup and the tick loop share one mutex over the lease state, so
//! cleanup cannot release leases (or drop the channels) while a tick still
//! holds them, and each channel is closed exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::repository::{RepositoryError, SchedulerRepository};
use crate::settings::SchedulingConfig;
use crate::types::{now_epoch_ms, ConcurrencyStrategyRow, Lease, LeaseKind, Worker};

const LEASE_CHANNEL_CAPACITY: usize = 8;

struct LeaseChannels {
    workers_tx: mpsc::Sender<Vec<Worker>>,
    queues_tx: mpsc::Sender<Vec<String>>,
    strategies_tx: mpsc::Sender<Vec<ConcurrencyStrategyRow>>,
}

/// Receiving ends handed to the tenant manager.
pub struct LeaseReceivers {
    pub workers_rx: mpsc::Receiver<Vec<Worker>>,
    pub queues_rx: mpsc::Receiver<Vec<String>>,
    pub strategies_rx: mpsc::Receiver<Vec<ConcurrencyStrategyRow>>,
}

struct LeaseState {
    worker_leases: Vec<Lease>,
    queue_leases: Vec<Lease>,
    strategy_leases: Vec<Lease>,
    channels: Option<LeaseChannels>,
    cleaned_up: bool,
}

pub struct LeaseManager {
    tenant_id: String,
    repo: Arc<dyn SchedulerRepository>,
    config: SchedulingConfig,
    state: tokio::sync::Mutex<LeaseState>,
}

impl LeaseManager {
    pub fn new(
        tenant_id: impl Into<String>,
        repo: Arc<dyn SchedulerRepository>,
        config: SchedulingConfig,
    ) -> (Arc<Self>, LeaseReceivers) {
        let (workers_tx, workers_rx) = mpsc::channel(LEASE_CHANNEL_CAPACITY);
        let (queues_tx, queues_rx) = mpsc::channel(LEASE_CHANNEL_CAPACITY);
        let (strategies_tx, strategies_rx) = mpsc::channel(LEASE_CHANNEL_CAPACITY);

        let manager = Arc::new(Self {
            tenant_id: tenant_id.into(),
            repo,
            config,
            state: tokio::sync::Mutex::new(LeaseState {
                worker_leases: Vec::new(),
                queue_leases: Vec::new(),
                strategy_leases: Vec::new(),
                channels: Some(LeaseChannels {
                    workers_tx,
                    queues_tx,
                    strategies_tx,
                }),
                cleaned_up: false,
            }),
        });

        (
            manager,
            LeaseReceivers {
                workers_rx,
                queues_rx,
                strategies_rx,
            },
        )
    }

    /// Spawn the refresh loop. Exits once shutdown flips or cleanup ran.
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.lease_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if !manager.tick().await {
                            break;
                        }
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

    /// One refresh cycle for all three kinds. Returns false once cleanup has
    /// run. Storage errors skip the affected kind until the next tick.
    pub async fn tick(&self) -> bool {
        let mut st = self.state.lock().await;
        if st.cleaned_up {
            return false;
        }

        // Workers: the published payload is the worker objects themselves so
        // the scheduler sees the fresh action/label/capacity declarations.
        match self.repo.list_active_workers(&self.tenant_id).await {
            Ok(workers) => {
                let ids: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();
                let current = std::mem::take(&mut st.worker_leases);
                match self.refresh_kind(LeaseKind::Worker, &ids, current).await {
                    Ok(held) => {
                        let held_ids: HashSet<&str> =
                            held.iter().map(|l| l.resource_id.as_str()).collect();
                        let leased: Vec<Worker> = workers
                            .into_iter()
                            .filter(|w| held_ids.contains(w.id.as_str()))
                            .collect();
                        st.worker_leases = held;
                        if let Some(ch) = &st.channels {
                            // Drop-on-full: the next tick republishes.
                            let _ = ch.workers_tx.try_send(leased);
                        }
                    }
                    Err(err) => {
                        warn!(tenant = %self.tenant_id, error = %err, "worker lease refresh failed");
                    }
                }
            }
            Err(err) => {
                warn!(tenant = %self.tenant_id, error = %err, "listing active workers failed");
            }
        }

        // Queues.
        match self.repo.list_queues(&self.tenant_id).await {
            Ok(queues) => {
                let current = std::mem::take(&mut st.queue_leases);
                match self.refresh_kind(LeaseKind::Queue, &queues, current).await {
                    Ok(held) => {
                        let leased: Vec<String> =
                            held.iter().map(|l| l.resource_id.clone()).collect();
                        st.queue_leases = held;
                        if let Some(ch) = &st.channels {
                            let _ = ch.queues_tx.try_send(leased);
                        }
                    }
                    Err(err) => {
                        warn!(tenant = %self.tenant_id, error = %err, "queue lease refresh failed");
                    }
                }
            }
            Err(err) => {
                warn!(tenant = %self.tenant_id, error = %err, "listing queues failed");
            }
        }

        // Concurrency strategies.
        match self.repo.list_concurrency_strategies(&self.tenant_id).await {
            Ok(strategies) => {
                let active: Vec<ConcurrencyStrategyRow> =
                    strategies.into_iter().filter(|s| s.is_active).collect();
                let ids: Vec<String> = active.iter().map(|s| s.id.to_string()).collect();
                let current = std::mem::take(&mut st.strategy_leases);
                match self
                    .refresh_kind(LeaseKind::ConcurrencyStrategy, &ids, current)
                    .await
                {
                    Ok(held) => {
                        let held_ids: HashSet<&str> =
                            held.iter().map(|l| l.resource_id.as_str()).collect();
                        let leased: Vec<ConcurrencyStrategyRow> = active
                            .into_iter()
                            .filter(|s| held_ids.contains(s.id.to_string().as_str()))
                            .collect();
                        st.strategy_leases = held;
                        if let Some(ch) = &st.channels {
                            let _ = ch.strategies_tx.try_send(leased);
                        }
                    }
                    Err(err) => {
                        warn!(tenant = %self.tenant_id, error = %err, "strategy lease refresh failed");
                    }
                }
            }
            Err(err) => {
                warn!(tenant = %self.tenant_id, error = %err, "listing concurrency strategies failed");
            }
        }

        true
    }

    /// Diff held leases against the candidate list for one kind: release
    /// leases whose resource vanished, extend leases close to expiry, and
    /// acquire leases for newly-seen resources — the acquire/extend work is
    /// one batched storage call.
    async fn refresh_kind(
        &self,
        kind: LeaseKind,
        candidates: &[String],
        current: Vec<Lease>,
    ) -> Result<Vec<Lease>, RepositoryError> {
        let candidate_set: HashSet<&str> = candidates.iter().map(|s| s.as_str()).collect();

        let (kept, to_release): (Vec<Lease>, Vec<Lease>) = current
            .into_iter()
            .partition(|l| candidate_set.contains(l.resource_id.as_str()));

        if !to_release.is_empty() {
            debug!(
                tenant = %self.tenant_id,
                kind = ?kind,
                count = to_release.len(),
                "releasing leases for vanished resources"
            );
            self.repo
                .release_leases(&self.tenant_id, to_release)
                .await?;
        }

        let now = now_epoch_ms();
        let held_ids: HashSet<&str> = kept.iter().map(|l| l.resource_id.as_str()).collect();

        // Request ids needing acquisition (unseen) or extension (expiring
        // within the threshold); everything else keeps its current lease.
        let expiring: HashSet<&str> = kept
            .iter()
            .filter(|l| l.expires_at_ms - now <= self.config.lease_extend_threshold_ms)
            .map(|l| l.resource_id.as_str())
            .collect();
        let request_ids: Vec<String> = candidates
            .iter()
            .filter(|id| !held_ids.contains(id.as_str()) || expiring.contains(id.as_str()))
            .cloned()
            .collect();

        if request_ids.is_empty() {
            return Ok(kept);
        }

        let requested_set: HashSet<&str> = request_ids.iter().map(|s| s.as_str()).collect();
        let refreshed = self
            .repo
            .acquire_or_extend_leases(&self.tenant_id, kind, &request_ids, &kept)
            .await?;

        let mut held: Vec<Lease> = kept
            .into_iter()
            .filter(|l| !requested_set.contains(l.resource_id.as_str()))
            .collect();
        held.extend(refreshed);
        Ok(held)
    }

    /// Currently-held lease counts per kind, for tests and snapshots.
    pub async fn held_counts(&self) -> (usize, usize, usize) {
        let st = self.state.lock().await;
        (
            st.worker_leases.len(),
            st.queue_leases.len(),
            st.strategy_leases.len(),
        )
    }

    /// Release all held leases and close the channels exactly once. Safe to
    /// call while the tick loop is running: both sides take the state mutex.
    pub async fn cleanup(&self) {
        let mut st = self.state.lock().await;
        if st.cleaned_up {
            return;
        }
        st.cleaned_up = true;

        let mut all = Vec::new();
        all.append(&mut st.worker_leases);
        all.append(&mut st.queue_leases);
        all.append(&mut st.strategy_leases);

        if !all.is_empty() {
            let timeout = Duration::from_millis(self.config.lease_cleanup_timeout_ms);
            let release = self.repo.release_leases(&self.tenant_id, all);
            match tokio::time::timeout(timeout, release).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(tenant = %self.tenant_id, error = %err, "lease release during cleanup failed");
                }
                Err(_) => {
                    warn!(tenant = %self.tenant_id, "lease release during cleanup timed out");
                }
            }
        }

        // Dropping the senders closes each channel; guarded by cleaned_up so
        // this happens once.
        st.channels = None;
    }
}
