use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rds_error::{StoreError, StoreResult};
use rds_pool::{ConnectionFactory, Pool, PoolConfig};

struct CountingConn(u64);

struct CountingFactory {
    next_id: AtomicU64,
}

#[async_trait]
impl ConnectionFactory<CountingConn> for CountingFactory {
    async fn create(&self) -> StoreResult<CountingConn> {
        Ok(CountingConn(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

fn small_pool(max: usize) -> Pool<CountingConn> {
    let factory = Arc::new(CountingFactory {
        next_id: AtomicU64::new(0),
    });
    Pool::new(
        PoolConfig {
            min_connections: 0,
            max_connections: max,
            acquire_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        },
        factory,
    )
}

#[tokio::test]
async fn acquire_release_round_trip_preserves_total() {
    let pool = small_pool(2);
    pool.initialize().await.unwrap();

    let conn = pool.acquire().await.unwrap();
    let metrics = pool.metrics().await;
    assert_eq!(metrics.current_in_use, 1);
    drop(conn);

    // Release happens on a background task; give it a moment to run.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let metrics = pool.metrics().await;
    assert_eq!(metrics.current_in_use, 0);
    assert_eq!(metrics.current_idle, 1);
    assert_eq!(metrics.current_total, 1);
}

#[tokio::test]
async fn acquire_times_out_when_exhausted() {
    let pool = small_pool(1);
    pool.initialize().await.unwrap();

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, StoreError::PoolTimeout { .. }));
}

#[tokio::test]
async fn waiter_is_served_once_a_connection_is_released() {
    let pool = Arc::new(small_pool(1));
    pool.initialize().await.unwrap();

    let held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    let got = waiter.await.unwrap();
    assert!(got.is_ok());
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_acquire() {
    let pool = small_pool(2);
    pool.initialize().await.unwrap();
    pool.close().await;
    pool.close().await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, StoreError::PoolClosed));
}

#[tokio::test]
async fn with_connection_releases_even_when_closure_errors() {
    let pool = small_pool(1);
    pool.initialize().await.unwrap();

    let result: StoreResult<()> = pool
        .with_connection(|_conn| async { Err(StoreError::validation(vec![])) })
        .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let metrics = pool.metrics().await;
    assert_eq!(metrics.current_in_use, 0);
}
