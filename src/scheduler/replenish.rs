//! Slot pool refresh from durable storage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::repository::RepositoryError;
use crate::slot::{Action, Slot};

use super::Scheduler;

impl Scheduler {
    /// Reload worker capacity from storage into the in-memory slot pool.
    ///
    /// Skips if another replenish is already running (non-blocking try-lock)
    /// unless `must_replenish` is set. Actions are fully reloaded only when
    /// a heuristic says their pool is stale: zero active slots, half or more
    /// of the last-replenished slots consumed, or more workers available
    /// than last time. Currently-unacked slots are carried into the fresh
    /// lists so in-flight work is not double-counted.
    pub async fn replenish(&self, must_replenish: bool) -> Result<(), RepositoryError> {
        let _guard = if must_replenish {
            self.replenish_mu.lock().await
        } else {
            match self.replenish_mu.try_lock() {
                Ok(g) => g,
                Err(_) => {
                    debug!(tenant = %self.tenant_id, "replenish already in flight, skipping");
                    return Ok(());
                }
            }
        };

        let workers = self.workers_snapshot();
        let worker_count = workers.len();
        let worker_ids: Vec<String> = workers.keys().cloned().collect();

        // Phase 1: decide which actions need a full reload.
        let mut reload: HashSet<String> = HashSet::new();
        {
            let actions = self.actions.lock().unwrap();
            for (id, action) in actions.iter() {
                let active = action.active_slot_count();
                let last = action.last_replenished_slot_count();
                if active == 0
                    || active * 2 <= last
                    || worker_count > action.last_replenished_worker_count()
                {
                    reload.insert(id.clone());
                }
            }
        }

        if worker_ids.is_empty() {
            // Nothing to build; prune whatever is left and bail.
            self.prune_actions();
            return Ok(());
        }

        let slot_counts = self
            .repo
            .list_available_slots(&self.tenant_id, &worker_ids)
            .await?;
        let worker_actions = self
            .repo
            .list_actions_for_workers(&self.tenant_id, &worker_ids)
            .await?;

        // worker id -> declared action ids, and action id -> worker ids.
        let mut actions_by_worker: HashMap<&str, Vec<String>> = HashMap::new();
        let mut workers_by_action: HashMap<String, Vec<&str>> = HashMap::new();
        for wa in &worker_actions {
            actions_by_worker
                .entry(wa.worker_id.as_str())
                .or_default()
                .push(wa.action_id.clone());
            workers_by_action
                .entry(wa.action_id.clone())
                .or_default()
                .push(wa.worker_id.as_str());
        }

        // Actions we have never seen always load.
        {
            let actions = self.actions.lock().unwrap();
            for action_id in workers_by_action.keys() {
                if !actions.contains_key(action_id) {
                    reload.insert(action_id.clone());
                }
            }
        }

        if reload.is_empty() {
            self.prune_actions();
            return Ok(());
        }

        // Unacked slots per worker: storage does not see unflushed
        // assignments yet, so subtract them from the reported availability.
        // Collect the slot objects too; they are carried into fresh lists.
        let (unacked_per_worker, unacked_slots) = {
            let unacked = self.unacked.lock().unwrap();
            let mut per_worker: HashMap<String, u32> = HashMap::new();
            let mut slots: Vec<Arc<Slot>> = Vec::with_capacity(unacked.len());
            for slot in unacked.values() {
                *per_worker.entry(slot.worker_id().to_string()).or_insert(0) += 1;
                slots.push(slot.clone());
            }
            (per_worker, slots)
        };

        // Phase 2: build one fresh slot pool per worker, shared across all
        // of that worker's actions so one unit of capacity can only be
        // claimed once no matter which action claims it.
        let mut pool_by_worker: HashMap<&str, Vec<Arc<Slot>>> = HashMap::new();
        for sc in &slot_counts {
            let Some(declared) = actions_by_worker.get(sc.worker_id.as_str()) else {
                continue;
            };
            let consumed = unacked_per_worker
                .get(sc.worker_id.as_str())
                .copied()
                .unwrap_or(0);
            let available = sc.available_slots.saturating_sub(consumed);
            let slots: Vec<Arc<Slot>> = (0..available)
                .map(|_| {
                    Arc::new(Slot::new(
                        sc.worker_id.clone(),
                        declared.clone(),
                        self.config.slot_expiry_ms,
                    ))
                })
                .collect();
            pool_by_worker.insert(sc.worker_id.as_str(), slots);
        }

        // Phase 3: commit. Per reloaded action: gather its workers' fresh
        // slots, carry over unacked slots belonging to it, shuffle so
        // assignment does not bias toward storage list order, and swap the
        // list in. Lock order: actions map, then per-action state, then
        // unacked (already released above).
        let mut rng = rand::thread_rng();
        {
            let mut actions = self.actions.lock().unwrap();
            for action_id in &reload {
                let mut slots: Vec<Arc<Slot>> = Vec::new();
                if let Some(worker_ids) = workers_by_action.get(action_id) {
                    for wid in worker_ids {
                        if let Some(pool) = pool_by_worker.get(wid) {
                            slots.extend(pool.iter().cloned());
                        }
                    }
                }
                for slot in &unacked_slots {
                    if slot.actions().iter().any(|a| a == action_id) {
                        slot.extend_expiry(self.config.slot_expiry_ms);
                        slots.push(slot.clone());
                    }
                }
                slots.shuffle(&mut rng);

                if slots.is_empty() {
                    actions.remove(action_id);
                    continue;
                }

                let worker_count_for_action = workers_by_action
                    .get(action_id)
                    .map(|w| w.len())
                    .unwrap_or(0);
                let action = actions
                    .entry(action_id.clone())
                    .or_insert_with(|| Arc::new(Action::new(action_id.clone())));
                action.set_slots(slots, worker_count_for_action);
            }
        }

        self.prune_actions();

        debug!(
            tenant = %self.tenant_id,
            reloaded = reload.len(),
            workers = worker_count,
            "replenish complete"
        );
        Ok(())
    }

    /// Drop expired unused slots and remove actions left with none, so
    /// later assignment attempts fail fast as "no slots".
    fn prune_actions(&self) {
        let mut actions = self.actions.lock().unwrap();
        actions.retain(|_, action| action.prune_expired() > 0);
    }
}
