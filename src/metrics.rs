//! Prometheus metrics for the scheduling engine.
//!
//! This module provides:
//! - Pre-defined metric instruments for the assignment and slot-pool paths
//! - A built-in [`MetricsExtension`] that feeds them from extension hooks
//! - An HTTP server for the `/metrics` endpoint
//!
//! # Usage
//!
//! Initialize metrics once at startup:
//! ```ignore
//! let metrics = gantry::metrics::init()?;
//! pool.register_extension(Arc::new(MetricsExtension::new(metrics.clone())));
//! ```
//!
//! Then start the metrics server:
//! ```ignore
//! gantry::metrics::run_metrics_server(addr, metrics, shutdown_rx).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::extensions::{Extension, SchedulerSnapshot};
use crate::types::QueueResults;

/// Histogram buckets for assigned-items-per-flush counts.
const FLUSH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Assignment outcome counters, per queue flush
    items_assigned: CounterVec,
    items_unassigned: CounterVec,
    items_rate_limited: CounterVec,
    items_timed_out: CounterVec,
    batch_items_assigned: CounterVec,
    assigned_per_flush: HistogramVec,

    // Slot pool gauges, from scheduler snapshots
    slots_total: GaugeVec,
    slots_active: GaugeVec,
    unacked_slots: GaugeVec,
    workers_known: GaugeVec,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcomes of one queue flush.
    pub fn record_flush(&self, results: &QueueResults) {
        let tenant = results.tenant_id.as_str();
        let queue = results.queue.as_str();
        if !results.assigned.is_empty() {
            self.items_assigned
                .with_label_values(&[tenant, queue])
                .inc_by(results.assigned.len() as f64);
            self.assigned_per_flush
                .with_label_values(&[tenant])
                .observe(results.assigned.len() as f64);
            let batched = results.assigned.iter().filter(|a| a.batch.is_some()).count();
            if batched > 0 {
                self.batch_items_assigned
                    .with_label_values(&[tenant])
                    .inc_by(batched as f64);
            }
        }
        if !results.unassigned.is_empty() {
            self.items_unassigned
                .with_label_values(&[tenant, queue])
                .inc_by(results.unassigned.len() as f64);
        }
        if !results.rate_limited.is_empty() {
            self.items_rate_limited
                .with_label_values(&[tenant, queue])
                .inc_by(results.rate_limited.len() as f64);
        }
        if !results.scheduling_timed_out.is_empty() {
            self.items_timed_out
                .with_label_values(&[tenant, queue])
                .inc_by(results.scheduling_timed_out.len() as f64);
        }
    }

    /// Update slot pool gauges from a scheduler snapshot.
    pub fn record_snapshot(&self, snapshot: &SchedulerSnapshot) {
        let tenant = snapshot.tenant_id.as_str();
        for action in &snapshot.actions {
            self.slots_total
                .with_label_values(&[tenant, action.action_id.as_str()])
                .set(action.total_slots as f64);
            self.slots_active
                .with_label_values(&[tenant, action.action_id.as_str()])
                .set(action.active_slots as f64);
        }
        self.unacked_slots
            .with_label_values(&[tenant])
            .set(snapshot.unacked_slots as f64);
        self.workers_known
            .with_label_values(&[tenant])
            .set(snapshot.workers as f64);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let items_assigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_assigned_total",
                "Total queue items assigned to workers",
            ),
            &["tenant", "queue"],
        )?,
    );

    let items_unassigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_unassigned_total",
                "Total queue items offered but not placed (no slots)",
            ),
            &["tenant", "queue"],
        )?,
    );

    let items_rate_limited = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_rate_limited_total",
                "Total queue items deferred by a rate limit",
            ),
            &["tenant", "queue"],
        )?,
    );

    let items_timed_out = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_timed_out_total",
                "Total queue items whose scheduling deadline passed before assignment",
            ),
            &["tenant", "queue"],
        )?,
    );

    let batch_items_assigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_batch_items_assigned_total",
                "Total queue items committed as part of a batch group",
            ),
            &["tenant"],
        )?,
    );

    let assigned_per_flush = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "gantry_assigned_per_flush",
                "Assigned items per queue flush",
            )
            .buckets(FLUSH_SIZE_BUCKETS.to_vec()),
            &["tenant"],
        )?,
    );

    let slots_total = register(
        &registry,
        GaugeVec::new(
            Opts::new("gantry_slots_total", "Slots in the pool for an action"),
            &["tenant", "action"],
        )?,
    );

    let slots_active = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "gantry_slots_active",
                "Assignable (unused, unexpired) slots for an action",
            ),
            &["tenant", "action"],
        )?,
    );

    let unacked_slots = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "gantry_unacked_slots",
                "Assigned slots whose flush has not completed",
            ),
            &["tenant"],
        )?,
    );

    let workers_known = register(
        &registry,
        GaugeVec::new(
            Opts::new("gantry_workers_known", "Workers under lease for a tenant"),
            &["tenant"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        items_assigned,
        items_unassigned,
        items_rate_limited,
        items_timed_out,
        batch_items_assigned,
        assigned_per_flush,
        slots_total,
        slots_active,
        unacked_slots,
        workers_known,
    })
}

/// Built-in extension wiring scheduling activity into the metric instruments.
pub struct MetricsExtension {
    metrics: Metrics,
}

impl MetricsExtension {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

impl Extension for MetricsExtension {
    fn name(&self) -> &str {
        "metrics"
    }

    fn post_assign(&self, results: &QueueResults) {
        self.metrics.record_flush(results);
    }

    fn post_snapshot(&self, snapshot: &SchedulerSnapshot) {
        self.metrics.record_snapshot(snapshot);
    }
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when the shutdown channel flips.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
