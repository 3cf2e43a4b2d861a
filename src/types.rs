//! Core data model shared across the scheduling engine.
//!
//! These are plain owned values: they cross component boundaries by clone
//! and the storage layer owns the durable versions.

use std::collections::HashMap;

use serde::Deserialize;

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A tenant participating in scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tenant {
    pub id: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A label a worker declares about itself (key plus a string or int value).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLabel {
    pub key: String,
    pub str_value: Option<String>,
    pub int_value: Option<i64>,
}

/// An external worker process as reported by storage: stable id, supported
/// action types, affinity labels, and declared capacity in slot units.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: String,
    pub actions: Vec<String>,
    pub labels: Vec<WorkerLabel>,
    pub max_units: u32,
}

/// Identity of a queue, tagged by kind. The storage-facing name is pure
/// data computation over the parts, and `parse` of that name round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// A well-known durable queue addressed by bare name.
    Static { name: String },
    /// A queue owned by a single consumer; ephemeral unless marked durable.
    Consumer { consumer_id: String, durable: bool },
    /// A topic whose items are mirrored to every subscriber.
    Fanout { topic: String },
    /// A durable queue namespaced under a fixed prefix.
    Prefixed { prefix: String, name: String },
}

impl QueueId {
    /// Parse a storage-facing queue name. Returns `None` for names no queue
    /// kind claims: empty names, or a tagged kind with missing parts.
    pub fn parse(name: &str) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        let mut parts = name.splitn(2, ':');
        let head = parts.next().unwrap_or_default();
        match (head, parts.next()) {
            (_, None) => Some(Self::Static {
                name: name.to_string(),
            }),
            ("consumer", Some(rest)) => {
                let (id, durable) = match rest.strip_suffix(":durable") {
                    Some(id) => (id, true),
                    None => (rest, false),
                };
                if id.is_empty() {
                    return None;
                }
                Some(Self::Consumer {
                    consumer_id: id.to_string(),
                    durable,
                })
            }
            ("fanout", Some(topic)) => {
                if topic.is_empty() {
                    return None;
                }
                Some(Self::Fanout {
                    topic: topic.to_string(),
                })
            }
            (prefix, Some(rest)) => {
                if prefix.is_empty() || rest.is_empty() {
                    return None;
                }
                Some(Self::Prefixed {
                    prefix: prefix.to_string(),
                    name: rest.to_string(),
                })
            }
        }
    }

    /// The name used against storage and in result payloads.
    pub fn name(&self) -> String {
        match self {
            Self::Static { name } => name.clone(),
            Self::Consumer {
                consumer_id,
                durable: false,
            } => format!("consumer:{consumer_id}"),
            Self::Consumer {
                consumer_id,
                durable: true,
            } => format!("consumer:{consumer_id}:durable"),
            Self::Fanout { topic } => format!("fanout:{topic}"),
            Self::Prefixed { prefix, name } => format!("{prefix}:{name}"),
        }
    }

    /// Whether items in this queue survive their owner going away.
    pub fn durable(&self) -> bool {
        match self {
            Self::Static { .. } | Self::Prefixed { .. } => true,
            Self::Consumer { durable, .. } => *durable,
            Self::Fanout { .. } => false,
        }
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// How a step's desired label is compared against a worker label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelComparator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

/// An affinity constraint a queue item's step declares over worker labels.
/// `required` labels exclude non-matching workers entirely; optional labels
/// contribute `weight` to the worker's rank when satisfied.
#[derive(Debug, Clone)]
pub struct DesiredLabel {
    pub key: String,
    pub comparator: LabelComparator,
    pub str_value: Option<String>,
    pub int_value: Option<i64>,
    pub required: bool,
    pub weight: i64,
}

/// Sticky placement strategy for a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StickyStrategy {
    #[default]
    None,
    /// Prefer the desired worker but fall back to any.
    Soft,
    /// Only the desired worker may run the item; no spill.
    Hard,
}

/// One schedulable unit (a task attempt) as persisted by storage.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub tenant_id: String,
    pub queue: String,
    pub action_id: String,
    pub step_id: String,
    pub workflow_run_id: String,
    pub priority: i32,
    pub sticky: StickyStrategy,
    pub desired_worker_id: Option<String>,
    pub schedule_timeout_at_ms: Option<i64>,
    pub retry_count: i32,
    pub batch_key: Option<String>,
}

impl QueueItem {
    /// Whether the schedule-timeout deadline has already passed.
    pub fn timed_out(&self, now_ms: i64) -> bool {
        matches!(self.schedule_timeout_at_ms, Some(at) if at <= now_ms)
    }

    /// The key under which rate-limit reservations for this item are tracked.
    pub fn task_key(&self) -> String {
        self.id.to_string()
    }
}

/// Resource kinds partitioned across scheduler replicas via leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    Worker,
    Queue,
    ConcurrencyStrategy,
}

/// A time-boxed single-holder claim over one resource.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub kind: LeaseKind,
    pub resource_id: String,
    pub expires_at_ms: i64,
}

/// Concurrency admission algorithm evaluated in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyKind {
    RoundRobin,
    CancelInProgress,
    CancelNewest,
}

/// Per-step concurrency configuration row, optionally nested under a parent
/// strategy for grouped concurrency.
#[derive(Debug, Clone)]
pub struct ConcurrencyStrategyRow {
    pub id: i64,
    pub step_id: String,
    pub parent_strategy_id: Option<i64>,
    pub strategy: ConcurrencyKind,
    pub max_runs: i32,
    pub is_active: bool,
}

/// Per-step batching configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_runs: Option<i32>,
}

/// Why a batch was flushed, carried to the host in `BatchMetadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFlushReason {
    SizeReached,
    IntervalElapsed,
}

#[derive(Debug, Clone)]
pub struct BatchMetadata {
    pub batch_id: String,
    pub reason: BatchFlushReason,
    pub configured_size: usize,
    pub configured_interval_ms: u64,
    pub pending_count: usize,
}

/// A successful assignment of one queue item (or batch representative) to a
/// worker, ready for dispatch by the host.
#[derive(Debug, Clone)]
pub struct AssignedItem {
    pub worker_id: String,
    pub queue_item: QueueItem,
    pub batch: Option<BatchMetadata>,
}

/// A queue item that could not be assigned because a rate limit was hit.
#[derive(Debug, Clone)]
pub struct RateLimitedItem {
    pub queue_item: QueueItem,
    pub exceeded_key: String,
    pub exceeded_units: i64,
    /// The capacity observed when the reservation failed. May be lower than
    /// the stored capacity when in-flight reservations are outstanding.
    pub exceeded_capacity: i64,
}

/// The outcome of one assignment flush for a queue, tagged by tenant.
/// Capacity exhaustion and rate limiting are first-class variants here,
/// never errors.
#[derive(Debug, Clone, Default)]
pub struct QueueResults {
    pub tenant_id: String,
    pub queue: String,
    pub assigned: Vec<AssignedItem>,
    pub unassigned: Vec<QueueItem>,
    pub scheduling_timed_out: Vec<QueueItem>,
    pub rate_limited: Vec<RateLimitedItem>,
}

impl QueueResults {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
            && self.unassigned.is_empty()
            && self.scheduling_timed_out.is_empty()
            && self.rate_limited.is_empty()
    }
}

/// The outcome of one storage-side concurrency strategy evaluation.
#[derive(Debug, Clone)]
pub struct ConcurrencyResults {
    pub tenant_id: String,
    pub strategy_id: i64,
    pub step_id: String,
    pub queued_run_ids: Vec<String>,
    pub cancelled_run_ids: Vec<String>,
}

/// Available slot units for one worker, as reported by storage.
#[derive(Debug, Clone)]
pub struct WorkerSlotCount {
    pub worker_id: String,
    pub available_slots: u32,
}

/// One (worker, action) capability row.
#[derive(Debug, Clone)]
pub struct WorkerAction {
    pub worker_id: String,
    pub action_id: String,
}

/// Rate limits requested by queue items, keyed by item id then limit key.
pub type TaskRateLimits = HashMap<i64, HashMap<String, i64>>;
