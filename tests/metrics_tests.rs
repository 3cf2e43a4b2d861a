//! Metrics instrument tests: flush and snapshot recording end up in the
//! registry under the expected names.


use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};

use gantry::extensions::{ActionSnapshot, Extension, SchedulerSnapshot};
use gantry::metrics::{self, MetricsExtension};
use gantry::types::{AssignedItem, QueueResults, RateLimitedItem};
use test_helpers::{item, now_ms, TENANT};

fn render(metrics: &metrics::Metrics) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.registry().gather(), &mut buffer)
        .expect("encode");
    String::from_utf8(buffer).expect("utf8")
}

fn flush_results() -> QueueResults {
    QueueResults {
        tenant_id: TENANT.to_string(),
        queue: "q1".to_string(),
        assigned: vec![
            AssignedItem {
                worker_id: "w1".to_string(),
                queue_item: item(1, "q1", "a"),
                batch: None,
            },
            AssignedItem {
                worker_id: "w1".to_string(),
                queue_item: item(2, "q1", "a"),
                batch: None,
            },
        ],
        unassigned: vec![item(3, "q1", "a")],
        scheduling_timed_out: vec![item(4, "q1", "a")],
        rate_limited: vec![RateLimitedItem {
            queue_item: item(5, "q1", "a"),
            exceeded_key: "calls".to_string(),
            exceeded_units: 3,
            exceeded_capacity: 1,
        }],
    }
}

#[gantry::test]
async fn recorded_flushes_show_up_in_the_registry() {
    let metrics = metrics::init().expect("metrics init");
    metrics.record_flush(&flush_results());

    let rendered = render(&metrics);
    assert!(rendered
        .contains(r#"gantry_items_assigned_total{queue="q1",tenant="acme"} 2"#));
    assert!(rendered
        .contains(r#"gantry_items_unassigned_total{queue="q1",tenant="acme"} 1"#));
    assert!(rendered
        .contains(r#"gantry_items_timed_out_total{queue="q1",tenant="acme"} 1"#));
    assert!(rendered
        .contains(r#"gantry_items_rate_limited_total{queue="q1",tenant="acme"} 1"#));
    assert!(rendered.contains("gantry_assigned_per_flush"));
}

#[gantry::test]
async fn snapshots_drive_the_slot_gauges() {
    let metrics = metrics::init().expect("metrics init");
    metrics.record_snapshot(&SchedulerSnapshot {
        tenant_id: TENANT.to_string(),
        actions: vec![ActionSnapshot {
            action_id: "a".to_string(),
            total_slots: 4,
            active_slots: 3,
        }],
        unacked_slots: 1,
        workers: 2,
        taken_at_ms: now_ms(),
    });

    let rendered = render(&metrics);
    assert!(rendered.contains(r#"gantry_slots_total{action="a",tenant="acme"} 4"#));
    assert!(rendered.contains(r#"gantry_slots_active{action="a",tenant="acme"} 3"#));
    assert!(rendered.contains(r#"gantry_unacked_slots{tenant="acme"} 1"#));
    assert!(rendered.contains(r#"gantry_workers_known{tenant="acme"} 2"#));
}

#[gantry::test]
async fn batched_assignments_count_separately() {
    let metrics = metrics::init().expect("metrics init");
    let mut results = flush_results();
    results.assigned[0].batch = Some(gantry::types::BatchMetadata {
        batch_id: "b1".to_string(),
        reason: gantry::types::BatchFlushReason::SizeReached,
        configured_size: 2,
        configured_interval_ms: 1_000,
        pending_count: 0,
    });
    metrics.record_flush(&results);

    let rendered = render(&metrics);
    assert!(rendered.contains(r#"gantry_batch_items_assigned_total{tenant="acme"} 1"#));
}

#[gantry::test]
async fn extension_feeds_the_instruments_from_hooks() {
    let metrics = metrics::init().expect("metrics init");
    let extension = MetricsExtension::new(metrics.clone());
    assert_eq!(extension.name(), "metrics");

    extension.post_assign(&flush_results());
    let rendered = render(&metrics);
    assert!(rendered
        .contains(r#"gantry_items_assigned_total{queue="q1",tenant="acme"} 2"#));
}

#[gantry::test]
async fn extension_registers_on_a_pool() {
    let repo = test_helpers::FakeRepository::new();
    let pool = gantry::pool::SchedulingPool::new(
        test_helpers::as_repo(&repo),
        gantry::settings::SchedulingConfig::fast(),
    );
    let metrics = metrics::init().expect("metrics init");
    pool.register_extension(Arc::new(MetricsExtension::new(metrics)));
}
