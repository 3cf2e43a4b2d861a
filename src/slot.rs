//! Slot and action capacity model.
//!
//! A slot is one unit of a worker's declared capacity, shared across every
//! action group the worker supports. The same `Arc<Slot>` appears in
//! multiple action slot lists, so `try_use` is the single point of mutual
//! exclusion for that unit of capacity.
//!
//! # Key invariants
//!
//! - A slot is assignable only while *active*: not used and not expired.
//!   `try_use` atomically checks and claims under the per-slot lock.
//!
//! - Once used, a slot must eventually be `ack`ed (commit) or `nack`ed
//!   (release back to unused). Expiry bounds how long an unacked slot can
//!   block capacity if the owning process crashes.
//!
//! - Ack and nack chains run exactly once: the callbacks are drained under
//!   the lock on the first terminal call and later calls are no-ops. This
//!   is what lets rate-limit reservations ride along with slot commits.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{now_epoch_ms, DesiredLabel, LabelComparator, StickyStrategy, Worker};

/// Callback chained onto a slot's ack or nack.
pub type SlotCallback = Box<dyn FnOnce() + Send>;

struct SlotState {
    used: bool,
    acked: bool,
    expires_at_ms: i64,
    extra_acks: Vec<SlotCallback>,
    extra_nacks: Vec<SlotCallback>,
}

/// One assignable unit of a worker's capacity.
pub struct Slot {
    worker_id: String,
    actions: Vec<String>,
    state: Mutex<SlotState>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("Slot")
            .field("worker_id", &self.worker_id)
            .field("used", &st.used)
            .field("acked", &st.acked)
            .field("expires_at_ms", &st.expires_at_ms)
            .finish()
    }
}

impl Slot {
    pub fn new(worker_id: impl Into<String>, actions: Vec<String>, expiry_ms: i64) -> Self {
        Self {
            worker_id: worker_id.into(),
            actions,
            state: Mutex::new(SlotState {
                used: false,
                acked: false,
                expires_at_ms: now_epoch_ms() + expiry_ms,
                extra_acks: Vec::new(),
                extra_nacks: Vec::new(),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Atomically claim the slot. Returns false if it is already used or
    /// expired. On success the extra callbacks are chained onto the slot's
    /// eventual ack/nack.
    pub fn try_use(&self, extra_acks: Vec<SlotCallback>, extra_nacks: Vec<SlotCallback>) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.used || st.expires_at_ms <= now_epoch_ms() {
            return false;
        }
        st.used = true;
        st.extra_acks = extra_acks;
        st.extra_nacks = extra_nacks;
        true
    }

    /// Commit a used slot. Runs the chained ack callbacks once.
    pub fn ack(&self) {
        let acks = {
            let mut st = self.state.lock().unwrap();
            if !st.used || st.acked {
                return;
            }
            st.acked = true;
            st.extra_nacks.clear();
            std::mem::take(&mut st.extra_acks)
        };
        for cb in acks {
            cb();
        }
    }

    /// Release a used-but-uncommitted slot back to the pool. The slot
    /// becomes assignable again immediately.
    pub fn nack(&self) {
        let nacks = {
            let mut st = self.state.lock().unwrap();
            if !st.used || st.acked {
                return;
            }
            st.used = false;
            st.extra_acks.clear();
            std::mem::take(&mut st.extra_nacks)
        };
        for cb in nacks {
            cb();
        }
    }

    /// Unused and unexpired.
    pub fn is_active(&self) -> bool {
        let st = self.state.lock().unwrap();
        !st.used && st.expires_at_ms > now_epoch_ms()
    }

    pub fn is_used(&self) -> bool {
        self.state.lock().unwrap().used
    }

    pub fn is_acked(&self) -> bool {
        self.state.lock().unwrap().acked
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().unwrap().expires_at_ms <= now_epoch_ms()
    }

    /// Bump the expiry window, used when an unacked slot is carried across a
    /// replenish so in-flight work is not reaped mid-commit.
    pub fn extend_expiry(&self, expiry_ms: i64) {
        let mut st = self.state.lock().unwrap();
        st.expires_at_ms = now_epoch_ms() + expiry_ms;
    }
}

struct ActionState {
    slots: Vec<std::sync::Arc<Slot>>,
    last_replenished_slot_count: usize,
    last_replenished_worker_count: usize,
}

/// All slots, across all workers, able to execute one action id.
pub struct Action {
    action_id: String,
    state: Mutex<ActionState>,
}

impl Action {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            state: Mutex::new(ActionState {
                slots: Vec::new(),
                last_replenished_slot_count: 0,
                last_replenished_worker_count: 0,
            }),
        }
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Replace the slot list after a replenish cycle.
    pub fn set_slots(
        &self,
        slots: Vec<std::sync::Arc<Slot>>,
        worker_count: usize,
    ) {
        let mut st = self.state.lock().unwrap();
        st.last_replenished_slot_count = slots.len();
        st.last_replenished_worker_count = worker_count;
        st.slots = slots;
    }

    /// Snapshot of the current slot list (cheap Arc clones).
    pub fn slots(&self) -> Vec<std::sync::Arc<Slot>> {
        self.state.lock().unwrap().slots.clone()
    }

    pub fn active_slot_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn last_replenished_slot_count(&self) -> usize {
        self.state.lock().unwrap().last_replenished_slot_count
    }

    pub fn last_replenished_worker_count(&self) -> usize {
        self.state.lock().unwrap().last_replenished_worker_count
    }

    /// Drop expired unused slots. Returns the number of slots remaining.
    pub fn prune_expired(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        st.slots.retain(|s| s.is_used() || !s.is_expired());
        st.slots.len()
    }
}

/// Compute a worker's affinity score for the desired labels.
/// Returns -1 when a `required` label is unmet (the worker is excluded);
/// otherwise the sum of satisfied label weights.
pub fn affinity_score(worker: &Worker, labels: &[DesiredLabel]) -> i64 {
    let mut score = 0;
    for desired in labels {
        let matched = worker
            .labels
            .iter()
            .filter(|l| l.key == desired.key)
            .any(|l| label_matches(desired, l.str_value.as_deref(), l.int_value));
        if matched {
            score += desired.weight;
        } else if desired.required {
            return -1;
        }
    }
    score
}

fn label_matches(desired: &DesiredLabel, str_value: Option<&str>, int_value: Option<i64>) -> bool {
    if let (Some(want), Some(have)) = (desired.str_value.as_deref(), str_value) {
        return match desired.comparator {
            LabelComparator::Equal => have == want,
            LabelComparator::NotEqual => have != want,
            // Ordered comparators are only meaningful for ints.
            _ => false,
        };
    }
    if let (Some(want), Some(have)) = (desired.int_value, int_value) {
        return match desired.comparator {
            LabelComparator::Equal => have == want,
            LabelComparator::NotEqual => have != want,
            LabelComparator::GreaterThan => have > want,
            LabelComparator::GreaterThanOrEqual => have >= want,
            LabelComparator::LessThan => have < want,
            LabelComparator::LessThanOrEqual => have <= want,
        };
    }
    false
}

/// Filter and order an action's slots for one queue item.
///
/// HARD sticky restricts to the desired worker only (empty result when that
/// worker has no active slot — no spill). SOFT sticky prefers the desired
/// worker (rank 1) but allows any (rank 0). Affinity labels rank workers by
/// weighted match score, excluding workers that miss a required label. With
/// no sticky or affinity, all active slots rank 0.
///
/// Slots come back ordered rank-descending, ties broken by list order, with
/// each equal-rank run rotated by `ring_offset` so repeated calls
/// round-robin through equivalent slots.
pub fn ranked_slots(
    slots: &[std::sync::Arc<Slot>],
    sticky: StickyStrategy,
    desired_worker_id: Option<&str>,
    labels: &[DesiredLabel],
    workers: &HashMap<String, Worker>,
    ring_offset: usize,
) -> Vec<std::sync::Arc<Slot>> {
    let mut ranked: Vec<(i64, std::sync::Arc<Slot>)> = Vec::with_capacity(slots.len());

    for slot in slots {
        if !slot.is_active() {
            continue;
        }

        let rank = match sticky {
            StickyStrategy::Hard => match desired_worker_id {
                Some(desired) => {
                    if slot.worker_id() != desired {
                        continue;
                    }
                    0
                }
                // Hard sticky with no desired worker yet: any worker may
                // claim the first run and becomes the sticky target.
                None => 0,
            },
            StickyStrategy::Soft => match desired_worker_id {
                Some(desired) if slot.worker_id() == desired => 1,
                _ => 0,
            },
            StickyStrategy::None => {
                if labels.is_empty() {
                    0
                } else {
                    let Some(worker) = workers.get(slot.worker_id()) else {
                        continue;
                    };
                    let score = affinity_score(worker, labels);
                    if score < 0 {
                        continue;
                    }
                    score
                }
            }
        };

        ranked.push((rank, slot.clone()));
    }

    // Stable by construction: sort_by_key is stable, so ties keep list order.
    ranked.sort_by_key(|(rank, _)| std::cmp::Reverse(*rank));

    // Rotate each equal-rank run by the ring offset to spread load.
    let mut out: Vec<std::sync::Arc<Slot>> = Vec::with_capacity(ranked.len());
    let mut i = 0;
    while i < ranked.len() {
        let rank = ranked[i].0;
        let mut j = i;
        while j < ranked.len() && ranked[j].0 == rank {
            j += 1;
        }
        let run = &ranked[i..j];
        let offset = ring_offset % run.len();
        out.extend(run[offset..].iter().map(|(_, s)| s.clone()));
        out.extend(run[..offset].iter().map(|(_, s)| s.clone()));
        i = j;
    }
    out
}
