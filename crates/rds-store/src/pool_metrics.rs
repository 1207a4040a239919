//! Lets the façade surface pool metrics without being generic over a
//! connection type (spec §4.12 `pool_metrics`). Grounded on `mqk-daemon`'s
//! `AppState`, which holds pre-erased `Arc<...>` handles rather than
//! threading an extra type parameter through the whole app — here that
//! becomes a trait object instead of a concrete `Arc<RwLock<_>>`, since the
//! connection type a backend's pool uses is no business of the store core.

use rds_pool::PoolMetrics;

#[async_trait::async_trait]
pub trait PoolMetricsSource: Send + Sync {
    async fn pool_metrics(&self) -> PoolMetrics;
}

#[async_trait::async_trait]
impl<C: Send + 'static> PoolMetricsSource for rds_pool::Pool<C> {
    async fn pool_metrics(&self) -> PoolMetrics {
        self.metrics().await
    }
}
