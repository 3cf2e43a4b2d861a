use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level configuration for a host process embedding the scheduling pool.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
            enabled: false,
        }
    }
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

/// Tunables for the per-tenant scheduling loops. Every interval has a
/// production default matching the engine's 1s cadence; tests shrink them.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulingConfig {
    /// Lease list/acquire/extend cadence per resource kind.
    #[serde(default = "default_lease_interval_ms")]
    pub lease_interval_ms: u64,
    /// Leases expiring within this window get extended on the next tick.
    #[serde(default = "default_lease_extend_threshold_ms")]
    pub lease_extend_threshold_ms: i64,
    /// Wall-clock budget for releasing leases during cleanup.
    #[serde(default = "default_lease_cleanup_timeout_ms")]
    pub lease_cleanup_timeout_ms: u64,

    /// Periodic slot-pool refresh cadence.
    #[serde(default = "default_replenish_interval_ms")]
    pub replenish_interval_ms: u64,
    /// How long an assigned-but-unacked slot can hold capacity.
    #[serde(default = "default_slot_expiry_ms")]
    pub slot_expiry_ms: i64,

    /// Queue poll cadence and pull size.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    #[serde(default = "default_queue_pull_limit")]
    pub queue_pull_limit: usize,
    /// Refill from storage even when over the in-flight limit once results
    /// are at least this stale.
    #[serde(default = "default_queue_refill_stale_ms")]
    pub queue_refill_stale_ms: u64,
    /// Queue items are assigned in chunks of this size per action.
    #[serde(default = "default_assign_batch_size")]
    pub assign_batch_size: usize,

    #[serde(default = "default_rate_limit_flush_interval_ms")]
    pub rate_limit_flush_interval_ms: u64,

    #[serde(default = "default_concurrency_poll_interval_ms")]
    pub concurrency_poll_interval_ms: u64,
    #[serde(default = "default_concurrency_active_refresh_ms")]
    pub concurrency_active_refresh_ms: u64,
    /// Capacity of the parent/child strategy caches.
    #[serde(default = "default_strategy_cache_size")]
    pub strategy_cache_size: usize,

    #[serde(default = "default_batch_poll_interval_ms")]
    pub batch_poll_interval_ms: u64,
    #[serde(default = "default_batch_pull_limit")]
    pub batch_pull_limit: usize,
    /// A batch scheduler with nothing buffered and no active runs stops
    /// itself after this long.
    #[serde(default = "default_batch_idle_ttl_ms")]
    pub batch_idle_ttl_ms: u64,

    /// Per-call budget for storage batch operations.
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// Capacity of the results channels handed to the host.
    #[serde(default = "default_results_channel_capacity")]
    pub results_channel_capacity: usize,
}

fn default_lease_interval_ms() -> u64 {
    1_000
}
fn default_lease_extend_threshold_ms() -> i64 {
    10_000
}
fn default_lease_cleanup_timeout_ms() -> u64 {
    5_000
}
fn default_replenish_interval_ms() -> u64 {
    1_000
}
fn default_slot_expiry_ms() -> i64 {
    1_500
}
fn default_queue_poll_interval_ms() -> u64 {
    1_000
}
fn default_queue_pull_limit() -> usize {
    1_000
}
fn default_queue_refill_stale_ms() -> u64 {
    990
}
fn default_assign_batch_size() -> usize {
    50
}
fn default_rate_limit_flush_interval_ms() -> u64 {
    1_000
}
fn default_concurrency_poll_interval_ms() -> u64 {
    1_000
}
fn default_concurrency_active_refresh_ms() -> u64 {
    5_000
}
fn default_strategy_cache_size() -> usize {
    1_000
}
fn default_batch_poll_interval_ms() -> u64 {
    1_000
}
fn default_batch_pull_limit() -> usize {
    100
}
fn default_batch_idle_ttl_ms() -> u64 {
    60_000
}
fn default_storage_timeout_ms() -> u64 {
    15_000
}
fn default_results_channel_capacity() -> usize {
    1_000
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes with defaults")
    }
}

impl SchedulingConfig {
    /// A configuration with every timer shrunk for fast tests.
    pub fn fast() -> Self {
        Self {
            lease_interval_ms: 20,
            lease_extend_threshold_ms: 1_000,
            lease_cleanup_timeout_ms: 1_000,
            replenish_interval_ms: 20,
            slot_expiry_ms: 1_500,
            queue_poll_interval_ms: 20,
            queue_refill_stale_ms: 15,
            rate_limit_flush_interval_ms: 20,
            concurrency_poll_interval_ms: 20,
            concurrency_active_refresh_ms: 100,
            batch_poll_interval_ms: 20,
            batch_idle_ttl_ms: 500,
            storage_timeout_ms: 2_000,
            ..Self::default()
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
