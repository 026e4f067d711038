//! Connection pool bound under concurrent checkout

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use db_automation::Error;
use db_automation::engine::EngineKind;
use db_automation::pool::ConnectionPool;
use pretty_assertions::assert_eq;

use crate::helpers::ScriptedDb;

#[tokio::test]
async fn extra_acquire_fails_with_pool_exhausted() {
    let db = ScriptedDb::new(EngineKind::Postgres);
    let pool = ConnectionPool::new("orders", Arc::new(db.clone()), 3);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire(Duration::from_millis(100)).await.unwrap());
    }

    let started = tokio::time::Instant::now();
    let result = pool.acquire(Duration::from_millis(200)).await;
    assert_matches!(result, Err(Error::PoolExhausted { ref target, .. }) if target == "orders");
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert_eq!(pool.stats().in_use, 3);
    assert_eq!(db.opened(), 3);

    drop(held);
    assert_eq!(pool.stats().in_use, 0);
    assert_eq!(pool.stats().idle, 3);
}

#[tokio::test]
async fn blocked_acquire_gets_the_released_connection() {
    let db = ScriptedDb::new(EngineKind::Postgres);
    let pool = ConnectionPool::new("orders", Arc::new(db.clone()), 1);

    let first = pool.acquire(Duration::from_millis(100)).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.release(first);

    waiter.await.unwrap().unwrap();
    assert_eq!(db.opened(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_exceed_pool_size() {
    const POOL_SIZE: usize = 4;

    let db = ScriptedDb::new(EngineKind::Postgres).with_delay(Duration::from_millis(5));
    let pool = ConnectionPool::new("orders", Arc::new(db.clone()), POOL_SIZE);

    let holding = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let pool = pool.clone();
            let holding = holding.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let mut conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
                let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                conn.scalar("SELECT 1").await.unwrap();

                holding.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= POOL_SIZE);
    assert!(db.opened() <= POOL_SIZE);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn close_all_closes_idle_sessions_and_refuses_checkout() {
    let db = ScriptedDb::new(EngineKind::SqlServer);
    let pool = ConnectionPool::new("reporting", Arc::new(db.clone()), 2);

    {
        let _a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(100)).await.unwrap();
    }
    assert_eq!(db.live_sessions(), 2);

    pool.close_all().await;

    assert_eq!(db.live_sessions(), 0);
    assert_matches!(
        pool.acquire(Duration::from_millis(100)).await,
        Err(Error::PoolClosed(_))
    );
}
