//! Queuer pull/assign/flush cycle tests.


use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use gantry::batch::BatchRegistry;
use gantry::extensions::ExtensionRegistry;
use gantry::queuer::Queuer;
use gantry::rate_limiter::RateLimiter;
use gantry::scheduler::Scheduler;
use gantry::settings::SchedulingConfig;
use gantry::types::{QueueId, QueueResults};
use test_helpers::{as_repo, item, now_ms, worker, FakeRepository, TENANT};

struct Harness {
    repo: Arc<FakeRepository>,
    scheduler: Arc<Scheduler>,
    queuer: Arc<Queuer>,
    results_rx: mpsc::Receiver<QueueResults>,
    shutdown_tx: watch::Sender<bool>,
}

async fn harness(queue: &str) -> Harness {
    let repo = FakeRepository::new();
    let config = Arc::new(SchedulingConfig::fast());
    let scheduler = Scheduler::new(TENANT, as_repo(&repo), (*config).clone());
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));
    let extensions = ExtensionRegistry::new();
    let (results_tx, results_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let batches = BatchRegistry::new(
        TENANT,
        as_repo(&repo),
        Arc::clone(&config),
        Arc::clone(&scheduler),
        Arc::clone(&limiter),
        extensions.clone(),
        results_tx.clone(),
        shutdown_rx,
    );
    let queuer = Queuer::new(
        TENANT,
        QueueId::parse(queue).expect("queue name"),
        as_repo(&repo),
        config,
        Arc::clone(&scheduler),
        limiter,
        batches,
        extensions,
        results_tx,
    );
    Harness {
        repo,
        scheduler,
        queuer,
        results_rx,
        shutdown_tx,
    }
}

impl Harness {
    async fn ready_worker(&self, id: &str, action: &str, units: u32) {
        self.repo.add_worker(worker(id, &[action], units), units);
        self.scheduler
            .set_workers(self.repo.workers.lock().unwrap().clone());
        self.scheduler.replenish(true).await.expect("replenish");
    }
}

#[gantry::test]
async fn cycle_assigns_flushes_and_publishes() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 2).await;
    h.repo.push_item(item(1, "q1", "a"));
    h.repo.push_item(item(2, "q1", "a"));

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    let rx = &mut h.results_rx;
    let mut assigned = with_timeout!(5_000, {
        let mut assigned = Vec::new();
        while assigned.len() < 2 {
            let results = rx.recv().await.expect("results");
            assert_eq!(results.tenant_id, TENANT);
            assert_eq!(results.queue, "q1");
            for a in results.assigned {
                assert_eq!(a.worker_id, "w1");
                assigned.push(a.queue_item.id);
            }
        }
        assigned
    });
    assigned.sort_unstable();
    assert_eq!(assigned, vec![1, 2]);
    assert!(h.repo.marked_count() >= 1);
    assert_eq!(h.scheduler.unacked_count(), 0);

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}

#[gantry::test]
async fn higher_priority_items_win_the_only_slot() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 1).await;
    let low = item(1, "q1", "a");
    let mut high = item(2, "q1", "a");
    high.priority = 5;
    h.repo.push_item(low);
    h.repo.push_item(high);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if results.assigned.is_empty() {
                continue;
            }
            assert_eq!(results.assigned[0].queue_item.id, 2);
            break;
        }
    });

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}

#[gantry::test]
async fn timed_out_items_are_reported_not_assigned() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 2).await;
    let mut expired = item(1, "q1", "a");
    expired.schedule_timeout_at_ms = Some(now_ms() - 1_000);
    h.repo.push_item(expired);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        let results = rx.recv().await.expect("results");
        assert!(results.assigned.is_empty());
        assert_eq!(results.scheduling_timed_out.len(), 1);
        assert_eq!(results.scheduling_timed_out[0].id, 1);
    });

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}

#[gantry::test]
async fn rejected_flush_nacks_and_retries() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 1).await;
    h.repo.push_item(item(1, "q1", "a"));
    h.repo.fail_mark_ids.lock().unwrap().insert(1);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    // Give the queuer a few cycles of storage rejecting the assignment.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    h.repo.fail_mark_ids.lock().unwrap().clear();
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if !results.assigned.is_empty() {
                assert_eq!(results.assigned[0].queue_item.id, 1);
                break;
            }
        }
    });

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
    // Every rejected assignment was nacked on the way: nothing leaked.
    assert_eq!(h.scheduler.unacked_count(), 0);
}

#[gantry::test]
async fn storage_error_during_flush_releases_slots() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 1).await;
    h.repo.push_item(item(1, "q1", "a"));
    h.repo
        .fail_mark_call
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(h.repo.marked_count(), 0);

    h.repo
        .fail_mark_call
        .store(false, std::sync::atomic::Ordering::Relaxed);
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if !results.assigned.is_empty() {
                break;
            }
        }
    });

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
    assert_eq!(h.scheduler.unacked_count(), 0);
}

#[gantry::test]
async fn batched_items_bypass_direct_assignment() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 2).await;
    let mut batched = item(1, "q1", "a");
    batched.batch_key = Some("k1".to_string());
    h.repo.push_item(batched);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    // The item never reaches the direct path; a batch coordinator owns it.
    assert_eq!(h.repo.marked_count(), 0);
    assert_eq!(h.scheduler.active_slot_count("a"), 2);

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}

#[gantry::test]
async fn transient_label_error_does_not_strand_items() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 1).await;
    h.repo.push_item(item(1, "q1", "a"));
    h.repo
        .fail_label_calls
        .store(1, std::sync::atomic::Ordering::Relaxed);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    // The failed cycle must put the drained item back in the buffer so a
    // later healthy cycle can still assign it.
    let rx = &mut h.results_rx;
    with_timeout!(5_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if results.assigned.iter().any(|a| a.queue_item.id == 1) {
                break;
            }
        }
    });
    assert_eq!(h.queuer.in_flight_count(), 0);

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}

#[gantry::test]
async fn hung_storage_flush_hits_the_budget_and_retries() {
    let mut h = harness("q1").await;
    h.ready_worker("w1", "a", 1).await;
    h.repo.push_item(item(1, "q1", "a"));
    h.repo
        .hang_mark_calls
        .store(1, std::sync::atomic::Ordering::Relaxed);

    let handle = h.queuer.start(h.shutdown_tx.subscribe());

    // The slot outlives its 1.5s expiry while the flush stalls against the
    // 2s storage budget. Production's replenish loop rebuilds expired
    // capacity; this harness only runs the queuer, so replenish once by
    // hand after the budget elapses.
    tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
    h.scheduler.replenish(true).await.expect("replenish");

    // The stalled flush is abandoned at the storage budget, the slot is
    // released, and a later cycle lands the item.
    let rx = &mut h.results_rx;
    with_timeout!(10_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if results.assigned.iter().any(|a| a.queue_item.id == 1) {
                break;
            }
        }
    });
    assert_eq!(h.scheduler.unacked_count(), 0);

    let _ = h.shutdown_tx.send(true);
    let _ = handle.await;
}
