//! rds-backend
//!
//! The `Backend` contract (spec §6) and a composite backend that fans a
//! single façade call out across several backends. The single-adapter-
//! behind-a-trait-boundary shape is grounded on
//! `mqk-execution::order_router::BrokerAdapter` (one trait, implemented
//! by whichever concrete adapter is injected, opaque to the caller).
//! Fanning one call out across several backends at once has no
//! precedent: `BrokerAdapter`/`OrderRouter` route to exactly one adapter
//! at a time, and nothing in the workspace's inspiration sources races
//! multiple backends concurrently — the composite/fan-out behavior here
//! is a novel addition for this spec's primary/cache read and write
//! strategies.

use std::collections::HashMap;
use std::sync::Arc;

use rds_entity::{Entity, FieldValue};
use rds_error::{StoreError, StoreResult, Violation};
use rds_query::Query;
use tokio::sync::watch;

/// What a backend's connection/session health currently looks like (spec
/// §3). Ordered `Healthy < Degraded < Unhealthy`; system health is the max
/// over every component's health.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Sync driver state a backend publishes (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Error,
    Paused,
    Disconnected,
}

/// What a backend can do, probed via flags rather than runtime type
/// introspection (spec §7 "Dynamic dispatch of backends").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub supports_offline: bool,
    pub supports_realtime: bool,
    pub supports_transactions: bool,
    pub supports_pagination: bool,
    pub supports_field_ops: bool,
    pub supports_crdt: bool,
}

fn unsupported(op: &str) -> StoreError {
    StoreError::validation(vec![Violation::new(op, "backend does not support this operation")])
}

/// The external collaborator every adapter (SQL/REST/realtime/CRDT
/// translator) implements. The core only ever calls through this trait —
/// it never inspects a concrete backend type.
#[async_trait::async_trait]
pub trait Backend<T: Entity>: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    async fn initialize(&self) -> StoreResult<()>;
    async fn close(&self) -> StoreResult<()>;

    async fn get(&self, id: &T::Id) -> StoreResult<Option<T>>;
    async fn get_all(&self, query: &Query) -> StoreResult<Vec<T>>;

    async fn save(&self, item: T) -> StoreResult<T>;
    async fn save_all(&self, items: Vec<T>) -> StoreResult<Vec<T>>;
    async fn delete(&self, id: &T::Id) -> StoreResult<()>;
    async fn delete_all(&self, ids: &[T::Id]) -> StoreResult<()>;
    async fn delete_where(&self, query: &Query) -> StoreResult<u64>;

    fn sync_status(&self) -> watch::Receiver<SyncStatus>;
    async fn pending_changes_count(&self) -> u64;
    async fn sync(&self) -> StoreResult<()>;

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    /// Optional field-level read (`supports_field_ops`). Backends that
    /// don't implement it fail with `Validation`, never silently dropping
    /// the request (spec §6).
    async fn get_field(&self, _id: &T::Id, _name: &str) -> StoreResult<FieldValue> {
        Err(unsupported("get_field"))
    }

    async fn get_field_batch(
        &self,
        _ids: &[T::Id],
        _name: &str,
    ) -> StoreResult<HashMap<T::Id, FieldValue>> {
        Err(unsupported("get_field_batch"))
    }

    /// Optional CRDT changeset exchange (`supports_crdt`).
    async fn get_changeset(&self, _since: Option<u64>) -> StoreResult<Vec<u8>> {
        Err(unsupported("get_changeset"))
    }

    async fn apply_changeset(&self, _changeset: &[u8]) -> StoreResult<()> {
        Err(unsupported("apply_changeset"))
    }

    fn node_id(&self) -> Option<String> {
        None
    }
}

/// Read fan-out strategy for `CompositeBackend` (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeReadStrategy {
    PrimaryFirst,
    CacheFirst,
    /// Race both; the first to resolve wins and the loser's result is
    /// discarded (spec §9 Open Question: tiebreak is implementation
    /// defined, but the discard rule is mandatory).
    Fastest,
}

/// Write fan-out strategy for `CompositeBackend` (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeWriteStrategy {
    PrimaryOnly,
    All,
    PrimaryAndCache,
}

/// Fans a single façade call out across a primary backend and an optional
/// cache-tier backend.
///
/// The historical bug this spec calls out by name — "missing await on the
/// fallback path" — is structurally avoided here: every fallback branch
/// below is a plain `.await` on the same async fn body, never a spawned
/// task whose handle could be dropped unobserved.
pub struct CompositeBackend<T: Entity> {
    primary: Arc<dyn Backend<T>>,
    cache: Option<Arc<dyn Backend<T>>>,
    read_strategy: CompositeReadStrategy,
    write_strategy: CompositeWriteStrategy,
}

impl<T: Entity> CompositeBackend<T> {
    pub fn new(
        primary: Arc<dyn Backend<T>>,
        cache: Option<Arc<dyn Backend<T>>>,
        read_strategy: CompositeReadStrategy,
        write_strategy: CompositeWriteStrategy,
    ) -> Self {
        Self {
            primary,
            cache,
            read_strategy,
            write_strategy,
        }
    }

    async fn get_primary_first(&self, id: &T::Id) -> StoreResult<Option<T>> {
        match self.primary.get(id).await {
            Ok(value) => Ok(value),
            Err(primary_err) => match &self.cache {
                Some(cache) => cache.get(id).await.map_err(|_| primary_err),
                None => Err(primary_err),
            },
        }
    }

    async fn get_cache_first(&self, id: &T::Id) -> StoreResult<Option<T>> {
        if let Some(cache) = &self.cache {
            if let Ok(Some(value)) = cache.get(id).await {
                return Ok(Some(value));
            }
        }
        self.primary.get(id).await
    }

    async fn get_fastest(&self, id: &T::Id) -> StoreResult<Option<T>> {
        let Some(cache) = &self.cache else {
            return self.primary.get(id).await;
        };
        let primary_fut = self.primary.get(id);
        let cache_fut = cache.get(id);
        tokio::select! {
            result = primary_fut => result,
            result = cache_fut => result,
        }
    }
}

#[async_trait::async_trait]
impl<T: Entity> Backend<T> for CompositeBackend<T> {
    fn capabilities(&self) -> BackendCapabilities {
        self.primary.capabilities()
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.primary.initialize().await?;
        if let Some(cache) = &self.cache {
            cache.initialize().await?;
        }
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.primary.close().await?;
        if let Some(cache) = &self.cache {
            cache.close().await?;
        }
        Ok(())
    }

    async fn get(&self, id: &T::Id) -> StoreResult<Option<T>> {
        match self.read_strategy {
            CompositeReadStrategy::PrimaryFirst => self.get_primary_first(id).await,
            CompositeReadStrategy::CacheFirst => self.get_cache_first(id).await,
            CompositeReadStrategy::Fastest => self.get_fastest(id).await,
        }
    }

    async fn get_all(&self, query: &Query) -> StoreResult<Vec<T>> {
        match self.read_strategy {
            CompositeReadStrategy::PrimaryFirst => match self.primary.get_all(query).await {
                Ok(items) => Ok(items),
                Err(primary_err) => match &self.cache {
                    Some(cache) => cache.get_all(query).await.map_err(|_| primary_err),
                    None => Err(primary_err),
                },
            },
            CompositeReadStrategy::CacheFirst => {
                if let Some(cache) = &self.cache {
                    if let Ok(items) = cache.get_all(query).await {
                        if !items.is_empty() {
                            return Ok(items);
                        }
                    }
                }
                self.primary.get_all(query).await
            }
            CompositeReadStrategy::Fastest => {
                let Some(cache) = &self.cache else {
                    return self.primary.get_all(query).await;
                };
                let primary_fut = self.primary.get_all(query);
                let cache_fut = cache.get_all(query);
                tokio::select! {
                    result = primary_fut => result,
                    result = cache_fut => result,
                }
            }
        }
    }

    async fn save(&self, item: T) -> StoreResult<T> {
        match self.write_strategy {
            CompositeWriteStrategy::PrimaryOnly => self.primary.save(item).await,
            CompositeWriteStrategy::All => {
                let saved = self.primary.save(item.clone()).await?;
                if let Some(cache) = &self.cache {
                    // Fallback awaited fully before this fn returns — the
                    // precise failure mode this spec calls out.
                    let _ = cache.save(item).await;
                }
                Ok(saved)
            }
            CompositeWriteStrategy::PrimaryAndCache => {
                let saved = self.primary.save(item.clone()).await?;
                if let Some(cache) = &self.cache {
                    cache.save(item).await?;
                }
                Ok(saved)
            }
        }
    }

    async fn save_all(&self, items: Vec<T>) -> StoreResult<Vec<T>> {
        match self.write_strategy {
            CompositeWriteStrategy::PrimaryOnly => self.primary.save_all(items).await,
            CompositeWriteStrategy::All => {
                let saved = self.primary.save_all(items.clone()).await?;
                if let Some(cache) = &self.cache {
                    let _ = cache.save_all(items).await;
                }
                Ok(saved)
            }
            CompositeWriteStrategy::PrimaryAndCache => {
                let saved = self.primary.save_all(items.clone()).await?;
                if let Some(cache) = &self.cache {
                    cache.save_all(items).await?;
                }
                Ok(saved)
            }
        }
    }

    async fn delete(&self, id: &T::Id) -> StoreResult<()> {
        self.primary.delete(id).await?;
        if matches!(self.write_strategy, CompositeWriteStrategy::All | CompositeWriteStrategy::PrimaryAndCache) {
            if let Some(cache) = &self.cache {
                cache.delete(id).await?;
            }
        }
        Ok(())
    }

    async fn delete_all(&self, ids: &[T::Id]) -> StoreResult<()> {
        self.primary.delete_all(ids).await?;
        if matches!(self.write_strategy, CompositeWriteStrategy::All | CompositeWriteStrategy::PrimaryAndCache) {
            if let Some(cache) = &self.cache {
                cache.delete_all(ids).await?;
            }
        }
        Ok(())
    }

    async fn delete_where(&self, query: &Query) -> StoreResult<u64> {
        let count = self.primary.delete_where(query).await?;
        if matches!(self.write_strategy, CompositeWriteStrategy::All | CompositeWriteStrategy::PrimaryAndCache) {
            if let Some(cache) = &self.cache {
                cache.delete_where(query).await?;
            }
        }
        Ok(count)
    }

    fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.primary.sync_status()
    }

    async fn pending_changes_count(&self) -> u64 {
        self.primary.pending_changes_count().await
    }

    async fn sync(&self) -> StoreResult<()> {
        self.primary.sync().await
    }

    async fn health(&self) -> HealthStatus {
        let primary = self.primary.health().await;
        match &self.cache {
            Some(cache) => primary.max(cache.health().await),
            None => primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::ValueMap;
    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        body: String,
    }

    impl Entity for Doc {
        type Id = String;
        fn id(&self) -> Self::Id {
            self.id.clone()
        }
        fn to_value_map(&self) -> ValueMap {
            rds_entity::to_value_map_via_serde(self).unwrap()
        }
        fn from_value_map(map: ValueMap) -> StoreResult<Self> {
            rds_entity::from_value_map_via_serde(map)
        }
    }

    struct FakeBackend {
        store: Mutex<HashMap<String, Doc>>,
        fail_get: bool,
    }

    impl FakeBackend {
        fn new(fail_get: bool) -> Self {
            Self {
                store: Mutex::new(HashMap::new()),
                fail_get,
            }
        }
    }

    #[async_trait::async_trait]
    impl Backend<Doc> for FakeBackend {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }
        async fn initialize(&self) -> StoreResult<()> {
            Ok(())
        }
        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
        async fn get(&self, id: &String) -> StoreResult<Option<Doc>> {
            if self.fail_get {
                return Err(StoreError::network("down"));
            }
            Ok(self.store.lock().await.get(id).cloned())
        }
        async fn get_all(&self, _query: &Query) -> StoreResult<Vec<Doc>> {
            Ok(self.store.lock().await.values().cloned().collect())
        }
        async fn save(&self, item: Doc) -> StoreResult<Doc> {
            self.store.lock().await.insert(item.id.clone(), item.clone());
            Ok(item)
        }
        async fn save_all(&self, items: Vec<Doc>) -> StoreResult<Vec<Doc>> {
            for item in &items {
                self.store.lock().await.insert(item.id.clone(), item.clone());
            }
            Ok(items)
        }
        async fn delete(&self, id: &String) -> StoreResult<()> {
            self.store.lock().await.remove(id);
            Ok(())
        }
        async fn delete_all(&self, ids: &[String]) -> StoreResult<()> {
            let mut store = self.store.lock().await;
            for id in ids {
                store.remove(id);
            }
            Ok(())
        }
        async fn delete_where(&self, _query: &Query) -> StoreResult<u64> {
            Ok(0)
        }
        fn sync_status(&self) -> watch::Receiver<SyncStatus> {
            watch::channel(SyncStatus::Idle).1
        }
        async fn pending_changes_count(&self) -> u64 {
            0
        }
        async fn sync(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn primary_first_falls_back_to_cache_on_primary_error() {
        let primary = Arc::new(FakeBackend::new(true));
        let cache = Arc::new(FakeBackend::new(false));
        cache.save(Doc { id: "d1".into(), body: "cached".into() }).await.unwrap();

        let composite = CompositeBackend::new(
            primary,
            Some(cache),
            CompositeReadStrategy::PrimaryFirst,
            CompositeWriteStrategy::PrimaryOnly,
        );
        let got = composite.get(&"d1".to_string()).await.unwrap();
        assert_eq!(got.unwrap().body, "cached");
    }

    #[tokio::test]
    async fn primary_and_cache_write_propagates_to_both() {
        let primary = Arc::new(FakeBackend::new(false));
        let cache = Arc::new(FakeBackend::new(false));
        let composite = CompositeBackend::new(
            Arc::clone(&primary) as Arc<dyn Backend<Doc>>,
            Some(Arc::clone(&cache) as Arc<dyn Backend<Doc>>),
            CompositeReadStrategy::PrimaryFirst,
            CompositeWriteStrategy::PrimaryAndCache,
        );
        composite.save(Doc { id: "d1".into(), body: "x".into() }).await.unwrap();
        assert!(cache.store.lock().await.contains_key("d1"));
    }

    #[tokio::test]
    async fn primary_only_write_never_touches_cache() {
        let primary = Arc::new(FakeBackend::new(false));
        let cache = Arc::new(FakeBackend::new(false));
        let composite = CompositeBackend::new(
            Arc::clone(&primary) as Arc<dyn Backend<Doc>>,
            Some(Arc::clone(&cache) as Arc<dyn Backend<Doc>>),
            CompositeReadStrategy::PrimaryFirst,
            CompositeWriteStrategy::PrimaryOnly,
        );
        composite.save(Doc { id: "d1".into(), body: "x".into() }).await.unwrap();
        assert!(!cache.store.lock().await.contains_key("d1"));
    }

    #[tokio::test]
    async fn health_is_the_max_across_primary_and_cache() {
        struct DegradedBackend(FakeBackend);

        #[async_trait::async_trait]
        impl Backend<Doc> for DegradedBackend {
            fn capabilities(&self) -> BackendCapabilities {
                self.0.capabilities()
            }
            async fn initialize(&self) -> StoreResult<()> {
                self.0.initialize().await
            }
            async fn close(&self) -> StoreResult<()> {
                self.0.close().await
            }
            async fn get(&self, id: &String) -> StoreResult<Option<Doc>> {
                self.0.get(id).await
            }
            async fn get_all(&self, query: &Query) -> StoreResult<Vec<Doc>> {
                self.0.get_all(query).await
            }
            async fn save(&self, item: Doc) -> StoreResult<Doc> {
                self.0.save(item).await
            }
            async fn save_all(&self, items: Vec<Doc>) -> StoreResult<Vec<Doc>> {
                self.0.save_all(items).await
            }
            async fn delete(&self, id: &String) -> StoreResult<()> {
                self.0.delete(id).await
            }
            async fn delete_all(&self, ids: &[String]) -> StoreResult<()> {
                self.0.delete_all(ids).await
            }
            async fn delete_where(&self, query: &Query) -> StoreResult<u64> {
                self.0.delete_where(query).await
            }
            fn sync_status(&self) -> watch::Receiver<SyncStatus> {
                self.0.sync_status()
            }
            async fn pending_changes_count(&self) -> u64 {
                0
            }
            async fn sync(&self) -> StoreResult<()> {
                Ok(())
            }
            async fn health(&self) -> HealthStatus {
                HealthStatus::Degraded
            }
        }

        let primary = Arc::new(FakeBackend::new(false));
        let cache = Arc::new(DegradedBackend(FakeBackend::new(false)));
        let composite = CompositeBackend::new(
            primary,
            Some(cache),
            CompositeReadStrategy::PrimaryFirst,
            CompositeWriteStrategy::PrimaryOnly,
        );
        assert_eq!(composite.health().await, HealthStatus::Degraded);
    }
}
