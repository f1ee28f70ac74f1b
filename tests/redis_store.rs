//! Integration tests against a live Redis.
//!
//! Run with `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use ratemux::ratelimit::{EventLimiter, FixedWindowLimiter};
use ratemux::store::{RedisStore, WindowStore};

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    RedisStore::connect(&url).await.unwrap()
}

fn unique_prefix(test: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("ratemux-test:{}:{}", test, nanos)
}

#[tokio::test]
#[ignore]
async fn test_increment_sets_expiry_within_window() {
    let store = store().await;
    let key = unique_prefix("expiry");
    let window = Duration::from_secs(60);

    let first = store.increment(&key, window).await.unwrap();
    let second = store.increment(&key, window).await.unwrap();

    assert_eq!(first.count, 1);
    assert_eq!(second.count, 2);
    assert!(first.ttl > Duration::ZERO && first.ttl <= window);
    assert!(second.ttl <= first.ttl);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_processes_share_one_budget() {
    let shared: Arc<dyn WindowStore> = Arc::new(store().await);
    let prefix = unique_prefix("shared");
    let hour = Duration::from_secs(3600);
    let node_a = Arc::new(FixedWindowLimiter::new(shared.clone(), &prefix, hour, 20));
    let node_b = Arc::new(FixedWindowLimiter::new(shared, &prefix, hour, 20));

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let limiter = if i % 2 == 0 { node_a.clone() } else { node_b.clone() };
            tokio::spawn(async move { limiter.reserve_event("u1").await })
        })
        .collect();

    let admitted = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(admitted, 20);
}

#[tokio::test]
#[ignore]
async fn test_window_reset() {
    let shared: Arc<dyn WindowStore> = Arc::new(store().await);
    let prefix = unique_prefix("reset");
    let interval = Duration::from_millis(500);
    let limiter = FixedWindowLimiter::new(shared, &prefix, interval, 1);

    assert!(limiter.reserve_event("u1").await.unwrap().is_ok());
    tokio::time::sleep(interval).await;
    assert!(limiter.reserve_event("u1").await.unwrap().is_ok());
}
