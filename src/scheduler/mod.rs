//! Per-tenant slot pool and assignment state machine.
//!
//! The scheduler owns three pieces of state: the action map (action id to
//! slot group), the worker map (latest declarations from the lease cycle),
//! and the unacked map (assigned slots whose flush has not completed).
//!
//! # Lock order
//!
//! Locks nest in exactly one order everywhere in this module:
//!
//!   actions map -> per-action state -> unacked map
//!
//! `replenish` and `try_assign_batch` both follow it, which is the
//! deadlock-avoidance invariant for the whole subsystem. Per-slot locks are
//! leaves: no code path waits on another lock while holding one.

mod assign;
mod replenish;

pub use assign::{AssignResult, AssignedBatch};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::extensions::{ActionSnapshot, SchedulerSnapshot};
use crate::repository::SchedulerRepository;
use crate::settings::SchedulingConfig;
use crate::slot::{Action, Slot};
use crate::types::{now_epoch_ms, Worker};

pub struct Scheduler {
    tenant_id: String,
    repo: Arc<dyn SchedulerRepository>,
    config: SchedulingConfig,
    actions: Mutex<HashMap<String, Arc<Action>>>,
    workers: RwLock<HashMap<String, Worker>>,
    unacked: Mutex<HashMap<u64, Arc<Slot>>>,
    ack_seq: AtomicU64,
    // Non-blocking try-lock keeps at most one replenish in flight.
    replenish_mu: tokio::sync::Mutex<()>,
    ring_offsets: Mutex<HashMap<String, usize>>,
}

impl Scheduler {
    pub fn new(
        tenant_id: impl Into<String>,
        repo: Arc<dyn SchedulerRepository>,
        config: SchedulingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            repo,
            config,
            actions: Mutex::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            ack_seq: AtomicU64::new(0),
            replenish_mu: tokio::sync::Mutex::new(()),
            ring_offsets: Mutex::new(HashMap::new()),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Atomic replace of the worker map, called from lease updates.
    pub fn set_workers(&self, workers: Vec<Worker>) {
        let map: HashMap<String, Worker> =
            workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        *self.workers.write().unwrap() = map;
    }

    pub(crate) fn workers_snapshot(&self) -> HashMap<String, Worker> {
        self.workers.read().unwrap().clone()
    }

    pub(crate) fn action(&self, action_id: &str) -> Option<Arc<Action>> {
        self.actions.lock().unwrap().get(action_id).cloned()
    }

    pub(crate) fn next_ack_id(&self) -> u64 {
        self.ack_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn track_unacked(&self, ack_id: u64, slot: Arc<Slot>) {
        self.unacked.lock().unwrap().insert(ack_id, slot);
    }

    /// Commit previously-assigned slots.
    pub fn ack(&self, ack_ids: &[u64]) {
        let slots: Vec<Arc<Slot>> = {
            let mut unacked = self.unacked.lock().unwrap();
            ack_ids.iter().filter_map(|id| unacked.remove(id)).collect()
        };
        for slot in slots {
            slot.ack();
        }
    }

    /// Release previously-assigned slots back to the pool; they become
    /// assignable again immediately.
    pub fn nack(&self, ack_ids: &[u64]) {
        let slots: Vec<Arc<Slot>> = {
            let mut unacked = self.unacked.lock().unwrap();
            ack_ids.iter().filter_map(|id| unacked.remove(id)).collect()
        };
        for slot in slots {
            slot.nack();
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }

    pub fn active_slot_count(&self, action_id: &str) -> usize {
        self.action(action_id)
            .map(|a| a.active_slot_count())
            .unwrap_or(0)
    }

    pub(crate) fn ring_offset(&self, action_id: &str) -> usize {
        self.ring_offsets
            .lock()
            .unwrap()
            .get(action_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set_ring_offset(&self, action_id: &str, offset: usize) {
        self.ring_offsets
            .lock()
            .unwrap()
            .insert(action_id.to_string(), offset);
    }

    /// By-value snapshot for extensions. Extensions never see live state.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let actions: Vec<ActionSnapshot> = {
            let map = self.actions.lock().unwrap();
            map.values()
                .map(|a| ActionSnapshot {
                    action_id: a.action_id().to_string(),
                    total_slots: a.slot_count(),
                    active_slots: a.active_slot_count(),
                })
                .collect()
        };
        SchedulerSnapshot {
            tenant_id: self.tenant_id.clone(),
            actions,
            unacked_slots: self.unacked_count(),
            workers: self.workers.read().unwrap().len(),
            taken_at_ms: now_epoch_ms(),
        }
    }

    /// Periodic replenish loop. A failed cycle is logged and retried on the
    /// next tick; the pool degrades to stale slots rather than stopping.
    pub fn spawn_replenish_loop(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let interval = Duration::from_millis(scheduler.config.replenish_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if let Err(err) = scheduler.replenish(false).await {
                            warn!(tenant = %scheduler.tenant_id, error = %err, "replenish failed");
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
}
