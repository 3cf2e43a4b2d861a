//! Three-tier rate limiter accounting tests.


use std::collections::HashMap;
use std::sync::Arc;

use gantry::rate_limiter::{RateLimitOutcome, RateLimiter};
use test_helpers::{as_repo, FakeRepository, TENANT};

fn request(key: &str, units: i64) -> HashMap<String, i64> {
    [(key.to_string(), units)].into()
}

#[gantry::test]
async fn unknown_key_syncs_from_storage_before_checking() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    // No local knowledge of k1 yet; the check must read storage first.
    let outcome = limiter.use_units("t1", &request("k1", 6)).await.unwrap();
    assert_eq!(outcome, RateLimitOutcome::Reserved);
    assert_eq!(limiter.available("k1"), 4);
}

#[gantry::test]
async fn exceeded_reports_key_and_observable_capacity() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    assert_eq!(
        limiter.use_units("t1", &request("k1", 6)).await.unwrap(),
        RateLimitOutcome::Reserved
    );
    // The second caller sees the reduced in-flight capacity, not storage's 10.
    assert_eq!(
        limiter.use_units("t2", &request("k1", 6)).await.unwrap(),
        RateLimitOutcome::Exceeded {
            key: "k1".to_string(),
            requested: 6,
            capacity: 4,
        }
    );
}

#[gantry::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_reservations_grant_exactly_one() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .use_units(&format!("t{i}"), &request("k1", 6))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut reserved = 0;
    for task in tasks {
        if task.await.unwrap() == RateLimitOutcome::Reserved {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 1);
    assert!(limiter.available("k1") >= 0);
}

#[gantry::test]
async fn nack_returns_units_to_the_pool() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    limiter.use_units("t1", &request("k1", 6)).await.unwrap();
    assert_eq!(limiter.available("k1"), 4);

    limiter.nack("t1");
    assert_eq!(limiter.available("k1"), 10);
    // Nothing was consumed, so the next flush writes no deltas.
    limiter.flush().await.unwrap();
    assert!(repo.rate_limit_updates.lock().unwrap().is_empty());
}

#[gantry::test]
async fn ack_then_flush_writes_consumption_back() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    limiter.use_units("t1", &request("k1", 6)).await.unwrap();
    limiter.ack("t1");
    // Acking keeps the units deducted while they wait for write-back.
    assert_eq!(limiter.available("k1"), 4);

    limiter.flush().await.unwrap();
    let updates = repo.rate_limit_updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].get("k1"), Some(&6));
    // Storage's post-write value replaced the local authoritative copy.
    assert_eq!(limiter.available("k1"), 4);
}

#[gantry::test]
async fn available_never_goes_negative() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 5);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    for i in 0..10 {
        let outcome = limiter
            .use_units(&format!("t{i}"), &request("k1", 2))
            .await
            .unwrap();
        if outcome == RateLimitOutcome::Reserved && i % 2 == 0 {
            limiter.ack(&format!("t{i}"));
        } else if outcome == RateLimitOutcome::Reserved {
            limiter.nack(&format!("t{i}"));
        }
        assert!(limiter.available("k1") >= 0);
    }
}

#[gantry::test]
async fn multi_key_reservation_is_all_or_nothing() {
    let repo = FakeRepository::new();
    repo.set_rate_limit("k1", 10);
    repo.set_rate_limit("k2", 1);
    let limiter = RateLimiter::new(TENANT, as_repo(&repo));

    let mut requested = request("k1", 5);
    requested.insert("k2".to_string(), 2);

    let outcome = limiter.use_units("t1", &requested).await.unwrap();
    assert!(matches!(
        outcome,
        RateLimitOutcome::Exceeded { ref key, .. } if key == "k2"
    ));
    // The failed reservation must not leak k1 units.
    assert_eq!(limiter.available("k1"), 10);
}
