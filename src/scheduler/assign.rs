//! Queue item to slot matching.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::rate_limiter::{RateLimitOutcome, RateLimiter};
use crate::slot::{ranked_slots, SlotCallback};
use crate::types::{now_epoch_ms, DesiredLabel, QueueItem, TaskRateLimits};

use super::Scheduler;

/// Per-item assignment outcome. Capacity exhaustion, rate limiting, and
/// scheduling timeouts are first-class variants here, not errors.
#[derive(Debug)]
pub enum AssignResult {
    Assigned {
        ack_id: u64,
        worker_id: String,
        item: QueueItem,
    },
    NoSlots {
        item: QueueItem,
    },
    RateLimited {
        item: QueueItem,
        key: String,
        units: i64,
        capacity: i64,
    },
    SchedulingTimedOut {
        item: QueueItem,
    },
}

/// One streamed chunk of assignment results, flushable independently so
/// callers can pipeline the write-back while later chunks are still being
/// assigned.
#[derive(Debug)]
pub struct AssignedBatch {
    pub results: Vec<AssignResult>,
}

impl Scheduler {
    /// Assign a batch of queue items that share an action id.
    ///
    /// Rate limits are evaluated per item first; the slot walk then starts
    /// at `ring_offset` in the ranked ring so repeated calls spread load
    /// across equivalent slots. Each successful assignment is recorded
    /// under a fresh ack id pending commit. Returns the results and the
    /// advanced ring offset.
    pub async fn try_assign_batch(
        &self,
        action_id: &str,
        items: Vec<QueueItem>,
        ring_offset: usize,
        labels: &HashMap<String, Vec<DesiredLabel>>,
        rate_limits: &TaskRateLimits,
        limiter: &Arc<RateLimiter>,
    ) -> (Vec<AssignResult>, usize) {
        // Phase 1: reserve rate limits. Items that fail short-circuit to
        // RateLimited without touching slot state.
        let mut reserved: Vec<QueueItem> = Vec::with_capacity(items.len());
        let mut results: Vec<AssignResult> = Vec::with_capacity(items.len());
        for item in items {
            match rate_limits.get(&item.id) {
                Some(requested) if !requested.is_empty() => {
                    match limiter.use_units(&item.task_key(), requested).await {
                        Ok(RateLimitOutcome::Reserved) => reserved.push(item),
                        Ok(RateLimitOutcome::Exceeded {
                            key,
                            requested,
                            capacity,
                        }) => {
                            results.push(AssignResult::RateLimited {
                                item,
                                key,
                                units: requested,
                                capacity,
                            });
                        }
                        Err(err) => {
                            // Transient storage failure: treat as unassigned
                            // and let the next cycle retry.
                            debug!(error = %err, item = item.id, "rate limit check failed");
                            results.push(AssignResult::NoSlots { item });
                        }
                    }
                }
                _ => reserved.push(item),
            }
        }

        // Phase 2: walk the ranked slot ring. Lock order: actions map (via
        // self.action), per-action state (inside Action::slots), then the
        // unacked map on success.
        let action = self.action(action_id);
        let workers = self.workers_snapshot();
        let mut offset = ring_offset;

        for item in reserved {
            let has_reservation = rate_limits
                .get(&item.id)
                .map(|r| !r.is_empty())
                .unwrap_or(false);

            let Some(action) = &action else {
                if has_reservation {
                    limiter.nack(&item.task_key());
                }
                results.push(AssignResult::NoSlots { item });
                continue;
            };

            let item_labels: &[DesiredLabel] = labels
                .get(&item.step_id)
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            let slots = action.slots();
            let ranked = ranked_slots(
                &slots,
                item.sticky,
                item.desired_worker_id.as_deref(),
                item_labels,
                &workers,
                offset,
            );
            offset = offset.wrapping_add(1);

            let mut assigned = None;
            for slot in ranked {
                let (extra_acks, extra_nacks) = if has_reservation {
                    let ack_limiter = Arc::clone(limiter);
                    let nack_limiter = Arc::clone(limiter);
                    let ack_key = item.task_key();
                    let nack_key = item.task_key();
                    (
                        vec![Box::new(move || ack_limiter.ack(&ack_key)) as SlotCallback],
                        vec![Box::new(move || nack_limiter.nack(&nack_key)) as SlotCallback],
                    )
                } else {
                    (Vec::new(), Vec::new())
                };
                if slot.try_use(extra_acks, extra_nacks) {
                    let ack_id = self.next_ack_id();
                    self.track_unacked(ack_id, slot.clone());
                    assigned = Some((ack_id, slot.worker_id().to_string()));
                    break;
                }
            }

            match assigned {
                Some((ack_id, worker_id)) => {
                    results.push(AssignResult::Assigned {
                        ack_id,
                        worker_id,
                        item,
                    });
                }
                None => {
                    // Reservation rides on the slot; no slot means the
                    // reservation must be dropped here.
                    if has_reservation {
                        limiter.nack(&item.task_key());
                    }
                    results.push(AssignResult::NoSlots { item });
                }
            }
        }

        (results, offset)
    }

    /// Fan items out by action id and stream assignment results.
    ///
    /// Items whose schedule-timeout deadline has already passed route
    /// straight to `SchedulingTimedOut`. The rest are processed per action,
    /// in chunks, each chunk sent as soon as it is assigned so the caller
    /// can pipeline flush work. Actions run in parallel; there is no
    /// cross-action ordering guarantee.
    pub fn try_assign(
        self: &Arc<Self>,
        items: Vec<QueueItem>,
        labels: HashMap<String, Vec<DesiredLabel>>,
        rate_limits: TaskRateLimits,
        limiter: Arc<RateLimiter>,
    ) -> mpsc::Receiver<AssignedBatch> {
        let (tx, rx) = mpsc::channel(items.len().max(1));

        let now = now_epoch_ms();
        let (timed_out, live): (Vec<QueueItem>, Vec<QueueItem>) =
            items.into_iter().partition(|i| i.timed_out(now));

        if !timed_out.is_empty() {
            let results = timed_out
                .into_iter()
                .map(|item| AssignResult::SchedulingTimedOut { item })
                .collect();
            // Channel capacity covers every input item; this cannot block.
            let _ = tx.try_send(AssignedBatch { results });
        }

        let mut by_action: HashMap<String, Vec<QueueItem>> = HashMap::new();
        for item in live {
            by_action.entry(item.action_id.clone()).or_default().push(item);
        }

        let labels = Arc::new(labels);
        let rate_limits = Arc::new(rate_limits);
        let chunk_size = self.config.assign_batch_size;

        for (action_id, action_items) in by_action {
            let scheduler = Arc::clone(self);
            let labels = Arc::clone(&labels);
            let rate_limits = Arc::clone(&rate_limits);
            let limiter = Arc::clone(&limiter);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut offset = scheduler.ring_offset(&action_id);
                let mut remaining = action_items;
                while !remaining.is_empty() {
                    let rest = remaining.split_off(remaining.len().min(chunk_size));
                    let chunk = std::mem::replace(&mut remaining, rest);
                    let (results, new_offset) = scheduler
                        .try_assign_batch(
                            &action_id,
                            chunk,
                            offset,
                            &labels,
                            &rate_limits,
                            &limiter,
                        )
                        .await;
                    offset = new_offset;
                    if tx.send(AssignedBatch { results }).await.is_err() {
                        return;
                    }
                }
                scheduler.set_ring_offset(&action_id, offset);
            });
        }

        rx
    }
}
