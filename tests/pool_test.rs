//! Integration tests for the connection pool.

mod common;

use common::{MockConnector, cold_options, eventually};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tagsql::config::PoolOptions;
use tagsql::error::DbError;
use tokio::time::timeout;

#[tokio::test]
async fn test_idle_connections_reused_lifo() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &cold_options(5));

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    pool.release(a);
    pool.release(b);

    assert_eq!(pool.acquire().await.unwrap().id(), b_id);
    assert_eq!(pool.acquire().await.unwrap().id(), a_id);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_capacity_never_exceeded_under_contention() {
    let connector = MockConnector::new();
    connector.state.connect_delay_ms.store(5, Ordering::SeqCst);
    let pool = common::pool(connector.clone(), &cold_options(3));

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            let status = pool.status();
            assert!(status.total + status.pending <= 3);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(conn);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let status = pool.status();
    assert_eq!(status.total, 3);
    assert_eq!(status.idle, 3);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.waiting, 0);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_saturated_acquire_waits_for_release() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &cold_options(2));

    let a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    let a_id = a.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().waiting == 1).await);
    assert!(!waiter.is_finished());

    pool.release(a);
    let handed = waiter.await.unwrap().unwrap();
    assert_eq!(handed.id(), a_id);

    let status = pool.status();
    assert_eq!(status.total, 2);
    assert_eq!(status.in_use, 2);
    assert_eq!(status.idle, 0);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_waiters_served_in_arrival_order() {
    let pool = common::pool(MockConnector::new(), &cold_options(1));
    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().waiting == 1).await);
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().waiting == 2).await);

    pool.release(held);
    let conn = first.await.unwrap().unwrap();
    assert_eq!(conn.id(), held_id);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished());

    pool.release(conn);
    assert_eq!(second.await.unwrap().unwrap().id(), held_id);
}

#[tokio::test]
async fn test_dispose_rejects_waiters_and_later_acquires() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &cold_options(1));
    let _held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().waiting == 1).await);

    pool.dispose().await;

    assert!(matches!(waiter.await.unwrap(), Err(DbError::PoolDisposed)));
    assert!(matches!(pool.acquire().await, Err(DbError::PoolDisposed)));
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_release_after_dispose_is_ignored() {
    let pool = common::pool(MockConnector::new(), &cold_options(2));
    let conn = pool.acquire().await.unwrap();
    pool.dispose().await;

    pool.release(conn);
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn test_double_release_is_ignored() {
    let pool = common::pool(MockConnector::new(), &cold_options(2));
    let conn = pool.acquire().await.unwrap();

    pool.release(conn.clone());
    pool.release(conn);

    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.total, 1);
}

#[tokio::test]
async fn test_failed_creation_frees_capacity() {
    let connector = MockConnector::new();
    connector.state.failing_connects.store(1, Ordering::SeqCst);
    let pool = common::pool(connector.clone(), &cold_options(1));

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));

    let status = pool.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.total, 0);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.status().in_use, 1);
    pool.release(conn);
}

#[tokio::test]
async fn test_failed_creation_wakes_waiter() {
    let connector = MockConnector::new();
    connector.state.connect_delay_ms.store(100, Ordering::SeqCst);
    connector.state.failing_connects.store(1, Ordering::SeqCst);
    let pool = common::pool(connector.clone(), &cold_options(1));

    let creator = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().pending == 1).await);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    assert!(eventually(|| pool.status().waiting == 1).await);

    assert!(creator.await.unwrap().is_err());
    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(pool.status().in_use, 1);
    assert_eq!(conn.id(), 1);
}

#[tokio::test]
async fn test_creation_past_threshold_pre_warms() {
    let connector = MockConnector::new();
    let options = PoolOptions {
        max_connections: Some(10),
        pre_warm: Some(true),
        ..PoolOptions::default()
    };
    let pool = common::pool(connector.clone(), &options);

    let mut held = Vec::new();
    for _ in 0..7 {
        held.push(pool.acquire().await.unwrap());
    }

    assert!(eventually(|| pool.status().idle == 2).await);
    let status = pool.status();
    assert_eq!(status.total, 9);
    assert_eq!(status.in_use, 7);
    assert_eq!(status.pending, 0);
}

#[tokio::test]
async fn test_sampled_release_tops_up_idle_set() {
    let connector = MockConnector::new();
    let options = PoolOptions {
        max_connections: Some(10),
        pre_warm: Some(true),
        release_sample_interval: Some(1),
        ..PoolOptions::default()
    };
    let pool = common::pool(connector.clone(), &options);

    let conn = pool.acquire().await.unwrap();
    pool.release(conn);

    assert!(eventually(|| pool.status().idle == 2).await);
    assert_eq!(pool.status().total, 2);
}

#[tokio::test]
async fn test_no_pre_warm_when_disabled() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &cold_options(10));

    let mut held = Vec::new();
    for _ in 0..7 {
        held.push(pool.acquire().await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(pool.status().total, 7);
    assert_eq!(connector.state.connects.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_abandoned_creation_returns_capacity() {
    let connector = MockConnector::new();
    connector.state.connect_delay_ms.store(50, Ordering::SeqCst);
    let pool = common::pool(connector.clone(), &cold_options(1));

    let abandoned = timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(abandoned.is_err());
    assert_eq!(pool.status().pending, 0);

    connector.state.connect_delay_ms.store(0, Ordering::SeqCst);
    let conn = timeout(Duration::from_millis(500), pool.acquire())
        .await
        .expect("capacity freed by the abandoned creation")
        .unwrap();
    assert_eq!(pool.status().in_use, 1);
    pool.release(conn);
}

#[tokio::test]
async fn test_abandoned_wait_leaves_no_waiter() {
    let pool = common::pool(MockConnector::new(), &cold_options(1));
    let held = pool.acquire().await.unwrap();

    let abandoned = timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(abandoned.is_err());
    assert_eq!(pool.status().waiting, 0);

    pool.release(held);
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.in_use, 0);
}

fn sampled_acquire_options() -> PoolOptions {
    PoolOptions {
        max_connections: Some(10),
        pre_warm: Some(true),
        pre_warm_ratio: Some(1.0),
        acquire_sample_interval: Some(1),
        release_sample_interval: Some(1000),
        ..PoolOptions::default()
    }
}

#[tokio::test]
async fn test_sampled_acquire_tops_up_idle_set() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &sampled_acquire_options());

    let conn = pool.acquire().await.unwrap();
    pool.release(conn);
    assert_eq!(pool.status().total, 1);

    let conn = pool.acquire().await.unwrap();
    assert!(eventually(|| pool.status().idle == 2).await);
    let status = pool.status();
    assert_eq!(status.total, 3);
    assert_eq!(status.in_use, 1);
    pool.release(conn);
}

#[tokio::test]
async fn test_failed_pre_warm_stays_in_background() {
    let connector = MockConnector::new();
    let pool = common::pool(connector.clone(), &sampled_acquire_options());

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id();
    pool.release(conn);

    connector.state.failing_connects.store(1, Ordering::SeqCst);
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), first_id);

    assert!(eventually(|| connector.state.failing_connects.load(Ordering::SeqCst) == 0).await);
    assert!(eventually(|| pool.status().pending == 0).await);
    assert_eq!(pool.status().total, 1);

    pool.release(conn);
    assert_eq!(pool.acquire().await.unwrap().id(), first_id);
}

#[tokio::test]
async fn test_zero_max_connections_still_serves() {
    let pool = common::pool(MockConnector::new(), &cold_options(0));
    assert_eq!(pool.max_connections(), 1);

    let conn = timeout(Duration::from_millis(500), pool.acquire())
        .await
        .expect("pool of at least one connection")
        .unwrap();
    pool.release(conn);
}
