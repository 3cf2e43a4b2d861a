//! Gantry: a multi-tenant task-scheduling engine.
//!
//! Gantry assigns durable queue items to worker capacity under at-most-one
//! assignment, sticky and affinity placement, per-key rate limits, per-step
//! concurrency strategies, and batching. Multiple replicas partition the
//! work safely through time-boxed leases over workers, queues, and
//! concurrency strategies.
//!
//! The crate is a library: durable storage lives behind the
//! [`repository::SchedulerRepository`] trait, and a host service drives a
//! [`pool::SchedulingPool`] and consumes its results channels.

pub mod batch;
pub mod concurrency;
pub mod extensions;
pub mod lease_manager;
pub mod metrics;
pub mod pool;
pub mod queuer;
pub mod rate_limiter;
pub mod repository;
pub mod scheduler;
pub mod settings;
pub mod slot;
pub mod tenant;
pub mod trace;
pub mod types;

pub use pool::SchedulingPool;
pub use repository::{RepositoryError, SchedulerRepository};
pub use settings::{AppConfig, SchedulingConfig};
pub use types::{ConcurrencyResults, QueueResults, Tenant};

// Re-export the test attribute so tests can write `#[gantry::test]`.
pub use gantry_macros::test;
