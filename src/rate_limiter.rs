//! Tenant-scoped in-memory rate-limit accounting, synced with storage.
//!
//! Buckets are mirrored three ways: `db_values` (last authoritative value
//! read from storage), `unacked` (tentatively reserved by in-flight
//! assignments, keyed by task), and `unflushed` (consumed and acknowledged,
//! pending write-back). The observable capacity of a key is
//! `db_values - sum(unacked) - sum(unflushed)` and never goes negative.
//!
//! In-memory reservation happens BEFORE any durable write, mirroring the
//! reserve-then-write discipline of the concurrency counts: if a downstream
//! write fails, the caller nacks to roll the reservation back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::repository::{RepositoryError, SchedulerRepository};
use crate::settings::SchedulingConfig;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// All requested keys reserved under the task key; commit with `ack`,
    /// roll back with `nack`.
    Reserved,
    /// The first key that could not be satisfied, with the requested units
    /// and the capacity observable at the time of the check.
    Exceeded {
        key: String,
        requested: i64,
        capacity: i64,
    },
}

#[derive(Default)]
struct RateLimitState {
    db_values: HashMap<String, i64>,
    unacked: HashMap<String, HashMap<String, i64>>,
    unflushed: HashMap<String, i64>,
}

impl RateLimitState {
    fn available(&self, key: &str) -> i64 {
        let db = self.db_values.get(key).copied().unwrap_or(0);
        let unacked: i64 = self
            .unacked
            .values()
            .filter_map(|per_task| per_task.get(key))
            .sum();
        let unflushed = self.unflushed.get(key).copied().unwrap_or(0);
        db - unacked - unflushed
    }
}

pub struct RateLimiter {
    tenant_id: String,
    repo: Arc<dyn SchedulerRepository>,
    state: Mutex<RateLimitState>,
    // Serializes flush-to-database calls so only one read-modify-write is
    // in flight at a time.
    flush_mu: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(tenant_id: impl Into<String>, repo: Arc<dyn SchedulerRepository>) -> Arc<Self> {
        Arc::new(Self {
            tenant_id: tenant_id.into(),
            repo,
            state: Mutex::new(RateLimitState::default()),
            flush_mu: tokio::sync::Mutex::new(()),
        })
    }

    /// Try to reserve `requested` units under `task_key`. All-or-nothing:
    /// either every key is reserved or none is.
    ///
    /// When a requested key has never been seen locally, a flush is forced
    /// first so the check runs against fresh storage values.
    pub async fn use_units(
        &self,
        task_key: &str,
        requested: &HashMap<String, i64>,
    ) -> Result<RateLimitOutcome, RepositoryError> {
        if requested.is_empty() {
            return Ok(RateLimitOutcome::Reserved);
        }

        let any_unknown = {
            let st = self.state.lock().unwrap();
            requested.keys().any(|k| !st.db_values.contains_key(k))
        };
        if any_unknown {
            self.flush().await?;
        }

        let mut st = self.state.lock().unwrap();
        for (key, units) in requested {
            let capacity = st.available(key);
            if capacity < *units {
                debug!(
                    tenant = %self.tenant_id,
                    key = %key,
                    requested = units,
                    capacity,
                    "rate limit exceeded"
                );
                return Ok(RateLimitOutcome::Exceeded {
                    key: key.clone(),
                    requested: *units,
                    capacity,
                });
            }
        }
        st.unacked.insert(task_key.to_string(), requested.clone());
        Ok(RateLimitOutcome::Reserved)
    }

    /// Commit a reservation: the units become consumed-pending-write-back.
    pub fn ack(&self, task_key: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(reserved) = st.unacked.remove(task_key) {
            for (key, units) in reserved {
                *st.unflushed.entry(key).or_insert(0) += units;
            }
        }
    }

    /// Drop a reservation, returning the units to the pool.
    pub fn nack(&self, task_key: &str) {
        let mut st = self.state.lock().unwrap();
        st.unacked.remove(task_key);
    }

    /// Observable capacity of one key (db minus in-flight minus pending).
    pub fn available(&self, key: &str) -> i64 {
        self.state.lock().unwrap().available(key)
    }

    /// Send accumulated consumption to storage in one read-modify-write and
    /// replace the local authoritative values with what storage returns.
    pub async fn flush(&self) -> Result<(), RepositoryError> {
        let _guard = self.flush_mu.lock().await;

        let deltas = {
            let mut st = self.state.lock().unwrap();
            std::mem::take(&mut st.unflushed)
        };

        match self.repo.update_rate_limits(&self.tenant_id, &deltas).await {
            Ok(values) => {
                let mut st = self.state.lock().unwrap();
                st.db_values = values;
                Ok(())
            }
            Err(err) => {
                // Put the deltas back so no consumption is lost.
                let mut st = self.state.lock().unwrap();
                for (key, units) in deltas {
                    *st.unflushed.entry(key).or_insert(0) += units;
                }
                Err(err)
            }
        }
    }

    /// Periodic flush loop. Storage errors are logged and retried on the
    /// next tick.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        config: &SchedulingConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = Duration::from_millis(config.rate_limit_flush_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if let Err(err) = limiter.flush().await {
                            warn!(tenant = %limiter.tenant_id, error = %err, "rate limit flush failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Final best-effort flush so acknowledged consumption lands.
            if let Err(err) = limiter.flush().await {
                warn!(tenant = %limiter.tenant_id, error = %err, "final rate limit flush failed");
            }
        })
    }
}
