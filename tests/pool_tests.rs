//! End-to-end pool tests: tenant lifecycle and the full
//! lease-pull-assign-flush path driven through `SchedulingPool`.


use std::sync::Arc;
use std::time::Duration;

use gantry::pool::SchedulingPool;
use gantry::settings::SchedulingConfig;
use gantry::types::Tenant;
use test_helpers::{as_repo, item, worker, FakeRepository, TENANT};

fn seeded_repo() -> Arc<FakeRepository> {
    let repo = FakeRepository::new();
    repo.add_worker(worker("w1", &["a"], 2), 2);
    repo.queues.lock().unwrap().push("q1".to_string());
    repo
}

#[gantry::test]
async fn pool_assigns_enqueued_work_end_to_end() {
    let repo = seeded_repo();
    repo.push_item(item(1, "q1", "a"));
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());
    let mut results_rx = pool.take_results_rx().expect("results receiver");

    pool.set_tenants(vec![Tenant::new(TENANT)]).await;
    assert_eq!(pool.tenant_count().await, 1);
    pool.replenish(TENANT).await;

    let rx = &mut results_rx;
    with_timeout!(10_000, {
        let results = rx.recv().await.expect("results");
        assert_eq!(results.tenant_id, TENANT);
        assert_eq!(results.queue, "q1");
        assert_eq!(results.assigned.len(), 1);
        assert_eq!(results.assigned[0].worker_id, "w1");
    });
    assert!(repo.marked_count() >= 1);

    // Tenant-wide wakeups reach every held queue and strategy runner.
    repo.push_item(item(2, "q1", "a"));
    pool.notify_queues(TENANT).await;
    pool.notify_strategies(TENANT).await;
    let rx = &mut results_rx;
    with_timeout!(10_000, {
        loop {
            let results = rx.recv().await.expect("results");
            if results.assigned.iter().any(|a| a.queue_item.id == 2) {
                break;
            }
        }
    });

    pool.cleanup().await;
}

#[gantry::test]
async fn results_receiver_is_takeable_once() {
    let repo = seeded_repo();
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());

    assert!(pool.take_results_rx().is_some());
    assert!(pool.take_results_rx().is_none());
    assert!(pool.take_concurrency_results_rx().is_some());
    assert!(pool.take_concurrency_results_rx().is_none());
}

#[gantry::test]
async fn removed_tenants_release_their_leases() {
    let repo = seeded_repo();
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());
    let _results_rx = pool.take_results_rx();

    pool.set_tenants(vec![Tenant::new(TENANT)]).await;
    // Allow a few lease ticks so there is something to release.
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.set_tenants(Vec::new()).await;
    assert_eq!(pool.tenant_count().await, 0);

    let released = repo.released_leases.lock().unwrap();
    assert!(!released.is_empty());
    assert!(released.iter().any(|l| l.resource_id == "w1"));
    assert!(released.iter().any(|l| l.resource_id == "q1"));
}

#[gantry::test]
async fn set_tenants_keeps_existing_managers() {
    let repo = seeded_repo();
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());
    let _results_rx = pool.take_results_rx();

    pool.set_tenants(vec![Tenant::new(TENANT)]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Re-submitting the same set must not tear the tenant down.
    pool.set_tenants(vec![Tenant::new(TENANT)]).await;
    assert_eq!(pool.tenant_count().await, 1);
    assert!(repo.released_leases.lock().unwrap().is_empty());

    pool.cleanup().await;
}

#[gantry::test]
async fn notify_for_unknown_tenant_is_a_no_op() {
    let repo = seeded_repo();
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());

    pool.notify_queue("nobody", "q1").await;
    pool.notify_queues("nobody").await;
    pool.notify_strategy("nobody", 7).await;
    pool.notify_strategies("nobody").await;
    pool.replenish("nobody").await;
    assert_eq!(pool.tenant_count().await, 0);
}

#[gantry::test]
async fn cleanup_stops_every_tenant() {
    let repo = seeded_repo();
    let pool = SchedulingPool::new(as_repo(&repo), SchedulingConfig::fast());
    let _results_rx = pool.take_results_rx();

    pool.set_tenants(vec![Tenant::new(TENANT), Tenant::new("globex")]).await;
    assert_eq!(pool.tenant_count().await, 2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pool_ref = &pool;
    with_timeout!(10_000, {
        pool_ref.cleanup().await;
    });
    assert_eq!(pool.tenant_count().await, 0);
    assert!(!repo.released_leases.lock().unwrap().is_empty());
}
