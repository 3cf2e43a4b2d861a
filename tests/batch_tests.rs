//! Batch scheduler tests: size/interval flushes, one-slot atomic commits,
//! requeue on failure.


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use gantry::batch::BatchRegistry;
use gantry::extensions::ExtensionRegistry;
use gantry::rate_limiter::RateLimiter;
use gantry::scheduler::Scheduler;
use gantry::settings::SchedulingConfig;
use gantry::types::{BatchConfig, BatchFlushReason, QueueItem, QueueResults};
use test_helpers::{as_repo, item, now_ms, worker, FakeRepository, TENANT};

const STEP: &str = "step-a";

struct Harness {
    repo: Arc<FakeRepository>,
    scheduler: Arc<Scheduler>,
    registry: Arc<BatchRegistry>,
    results_rx: mpsc::Receiver<QueueResults>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness(units: u32) -> Harness {
    let repo = FakeRepository::new();
    repo.add_worker(worker("w1", &["a"], units), units);
    let config = Arc::new(SchedulingConfig::fast());
    let scheduler = Scheduler::new(TENANT, as_repo(&repo), (*config).clone());
    scheduler.set_workers(repo.workers.lock().unwrap().clone());
    scheduler.replenish(true).await.expect("replenish");
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));
    let (results_tx, results_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = BatchRegistry::new(
        TENANT,
        as_repo(&repo),
        config,
        Arc::clone(&scheduler),
        limiter,
        ExtensionRegistry::new(),
        results_tx,
        shutdown_rx,
    );
    Harness {
        repo,
        scheduler,
        registry,
        results_rx,
        _shutdown_tx: shutdown_tx,
    }
}

fn batched_item(id: i64) -> QueueItem {
    let mut i = item(id, "q1", "a");
    i.batch_key = Some("k1".to_string());
    i
}

#[gantry::test]
async fn size_reached_flushes_whole_group_on_one_slot() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            max_runs: None,
        },
    );
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.repo.push_batched(STEP, "k1", batched_item(2));

    h.registry.notify(STEP, "k1").await;

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 2);
        let batch = results.assigned[0].batch.as_ref().expect("batch metadata");
        assert_eq!(batch.reason, BatchFlushReason::SizeReached);
        assert_eq!(batch.configured_size, 2);
        // One batch id and one worker spans the whole group.
        for a in &results.assigned {
            assert_eq!(a.worker_id, "w1");
            assert_eq!(a.batch.as_ref().unwrap().batch_id, batch.batch_id);
        }
    });

    let commits = h.repo.batch_commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].2.len(), 2);
    // Exactly one slot consumed for the group of two.
    assert_eq!(h.scheduler.active_slot_count("a"), 1);
    assert_eq!(h.scheduler.unacked_count(), 0);

    h.registry.cleanup().await;
}

#[gantry::test]
async fn interval_elapsed_flushes_partial_group() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 10,
            flush_interval_ms: 50,
            max_runs: None,
        },
    );
    h.repo.push_batched(STEP, "k1", batched_item(1));

    h.registry.notify(STEP, "k1").await;

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 1);
        let batch = results.assigned[0].batch.as_ref().expect("batch metadata");
        assert_eq!(batch.reason, BatchFlushReason::IntervalElapsed);
    });

    h.registry.cleanup().await;
}

#[gantry::test]
async fn failed_commit_nacks_slot_and_requeues_group() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            max_runs: None,
        },
    );
    h.repo
        .fail_batch_commit
        .store(true, std::sync::atomic::Ordering::Relaxed);
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.repo.push_batched(STEP, "k1", batched_item(2));

    h.registry.notify(STEP, "k1").await;

    // Commits keep failing; the slot must come back every time and nothing
    // is half-committed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.repo.batch_commits.lock().unwrap().is_empty());

    h.repo
        .fail_batch_commit
        .store(false, std::sync::atomic::Ordering::Relaxed);
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 2);
    });
    let commits = h.repo.batch_commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].2.len(), 2);
    assert_eq!(h.scheduler.unacked_count(), 0);

    h.registry.cleanup().await;
}

#[gantry::test]
async fn timed_out_batched_items_are_reported_never_dropped() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 10,
            flush_interval_ms: 60_000,
            max_runs: None,
        },
    );
    let mut expired = batched_item(1);
    expired.schedule_timeout_at_ms = Some(now_ms() - 1_000);
    h.repo.push_batched(STEP, "k1", expired);

    h.registry.notify(STEP, "k1").await;

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert!(results.assigned.is_empty());
        assert_eq!(results.scheduling_timed_out.len(), 1);
        assert_eq!(results.scheduling_timed_out[0].id, 1);
    });
    assert!(h.repo.deleted_batched.lock().unwrap().contains(&1));
    assert!(h.repo.batch_commits.lock().unwrap().is_empty());

    h.registry.cleanup().await;
}

#[gantry::test]
async fn max_runs_holds_the_group_until_capacity_frees() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            max_runs: Some(1),
        },
    );
    h.repo.active_batch_runs.lock().unwrap().insert(STEP.to_string(), 1);
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.repo.push_batched(STEP, "k1", batched_item(2));

    h.registry.notify(STEP, "k1").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.repo.batch_commits.lock().unwrap().is_empty());

    h.repo.active_batch_runs.lock().unwrap().insert(STEP.to_string(), 0);
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 2);
    });

    h.registry.cleanup().await;
}

#[gantry::test]
async fn cancelled_items_are_dropped_at_flush_time() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            max_runs: Some(1),
        },
    );
    // Hold the flush with the run limit so both items sit in the buffer.
    h.repo.active_batch_runs.lock().unwrap().insert(STEP.to_string(), 1);
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.repo.push_batched(STEP, "k1", batched_item(2));
    h.registry.notify(STEP, "k1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Cancel item 2 out from under the coordinator, then release the hold.
    h.repo
        .batched
        .lock()
        .unwrap()
        .values_mut()
        .for_each(|v| v.retain(|i| i.id != 2));
    h.repo.active_batch_runs.lock().unwrap().insert(STEP.to_string(), 0);

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 1);
        assert_eq!(results.assigned[0].queue_item.id, 1);
    });
    let commits = h.repo.batch_commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].2.len(), 1);

    h.registry.cleanup().await;
}

#[gantry::test]
async fn idle_coordinator_stops_and_restarts_on_demand() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 1,
            flush_interval_ms: 60_000,
            max_runs: None,
        },
    );

    // Nothing buffered: the coordinator should expire after the idle TTL.
    h.registry.notify(STEP, "k1").await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // A new arrival spins up a fresh coordinator that still does the work.
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.registry.notify(STEP, "k1").await;

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 1);
    });
    assert_eq!(h.registry.coordinator_count(), 1);

    h.registry.cleanup().await;
}

#[gantry::test]
async fn unresolvable_queue_names_keep_the_group_buffered() {
    let h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 1,
            flush_interval_ms: 60_000,
            max_runs: None,
        },
    );
    let mut bad = batched_item(1);
    bad.queue = String::new();
    h.repo.push_batched(STEP, "k1", bad);

    h.registry.notify(STEP, "k1").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The group is requeued every cycle, never committed, dropped, or
    // charged against a slot.
    assert!(h.repo.batch_commits.lock().unwrap().is_empty());
    assert!(h.repo.deleted_batched.lock().unwrap().is_empty());
    assert_eq!(h.scheduler.unacked_count(), 0);

    h.registry.cleanup().await;
}

#[gantry::test]
async fn transient_count_error_requeues_the_group() {
    let mut h = harness(2).await;
    h.repo.set_batch_config(
        STEP,
        BatchConfig {
            batch_size: 2,
            flush_interval_ms: 60_000,
            max_runs: Some(1),
        },
    );
    h.repo
        .fail_count_calls
        .store(1, std::sync::atomic::Ordering::Relaxed);
    h.repo.push_batched(STEP, "k1", batched_item(1));
    h.repo.push_batched(STEP, "k1", batched_item(2));

    h.registry.notify(STEP, "k1").await;

    // The failed flush puts the group back; the read cursor is already past
    // it, so only the buffer can deliver it on the retry.
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.assigned.len(), 2);
    });
    {
        let commits = h.repo.batch_commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].2.len(), 2);
    }

    h.registry.cleanup().await;
}
