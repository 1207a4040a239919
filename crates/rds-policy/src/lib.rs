//! rds-policy
//!
//! Fetch-policy and write-policy state machines (spec §4.10, C10). The
//! route-through-one-injected-trait-object shape is grounded on
//! `mqk-execution::order_router::OrderRouter<B: BrokerAdapter>` — a thin
//! router generic over an injected adapter, translating calls without
//! knowing which concrete adapter it holds — generalized from routing to
//! one broker adapter into routing to one backend, gated by a breaker,
//! under a chosen fetch/write strategy. `Coalescer`'s in-flight-request
//! dedup has no precedent in `OrderRouter` or anywhere else in the
//! teacher; it's a novel addition for the "at most one in-flight fetch
//! per fingerprint" rule spec §4.10 names explicitly.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rds_backend::Backend;
use rds_cache::Cache;
use rds_entity::Entity;
use rds_error::{ErrorKind, StoreError, StoreResult};
use rds_pending::{ChangeOp, ChangeUpdate, PendingQueue};
use rds_query::Query;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Read strategies (spec §4.10).
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub enum FetchPolicy {
    CacheFirst,
    NetworkFirst,
    CacheAndNetwork,
    CacheOnly,
    NetworkOnly,
    StaleWhileRevalidate { threshold: Duration },
}

/// Write strategies (spec §4.10).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum WritePolicy {
    CacheAndNetwork,
    NetworkFirst,
    CacheFirst,
    CacheOnly,
}

/// Single-flight dedup: concurrent callers sharing a key all await the one
/// in-flight future and see an identical result (spec §5 "`get` coalescing
/// is deterministic"). `Arc<V>` is `Clone` unconditionally, so this works
/// even though `StoreError` itself carries a non-`Clone` boxed cause.
struct Coalescer<K, V> {
    in_flight: StdMutex<HashMap<K, broadcast::Sender<Arc<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Send + Sync + 'static> Coalescer<K, V> {
    fn new() -> Self {
        Self {
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    async fn run<F>(&self, key: K, fut: F) -> Arc<V>
    where
        F: Future<Output = V>,
    {
        enum Role<V> {
            Leader(broadcast::Sender<Arc<V>>),
            Follower(broadcast::Receiver<Arc<V>>),
        }

        let role = {
            let mut guard = self.in_flight.lock().unwrap();
            if let Some(tx) = guard.get(&key) {
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                guard.insert(key.clone(), tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                let result = Arc::new(fut.await);
                self.in_flight.lock().unwrap().remove(&key);
                let _ = tx.send(Arc::clone(&result));
                result
            }
            Role::Follower(mut rx) => rx
                .recv()
                .await
                .expect("leader sends exactly once before its sender is dropped"),
        }
    }
}

/// Coordinates the cache, pending queue, and backend for one entity type,
/// implementing the fetch/write policy table in spec §4.10.
pub struct PolicyEngine<T: Entity> {
    cache: Arc<StdMutex<Cache<T>>>,
    pending: Arc<StdMutex<PendingQueue<T>>>,
    backend: Arc<dyn Backend<T>>,
    breaker: Arc<rds_breaker::CircuitBreaker>,
    get_coalescer: Coalescer<T::Id, StoreResult<Option<T>>>,
    get_all_coalescer: Coalescer<u64, StoreResult<Vec<T>>>,
}

impl<T: Entity> PolicyEngine<T> {
    pub fn new(
        cache: Arc<StdMutex<Cache<T>>>,
        pending: Arc<StdMutex<PendingQueue<T>>>,
        backend: Arc<dyn Backend<T>>,
        breaker: Arc<rds_breaker::CircuitBreaker>,
    ) -> Self {
        Self {
            cache,
            pending,
            backend,
            breaker,
            get_coalescer: Coalescer::new(),
            get_all_coalescer: Coalescer::new(),
        }
    }

    /// Every remote call in this engine flows through the breaker (spec
    /// §4.4): admit, run, then record the outcome.
    async fn via_breaker<F, V>(&self, fut: F) -> StoreResult<V>
    where
        F: Future<Output = StoreResult<V>>,
    {
        via_breaker(&self.breaker, fut).await
    }

    pub async fn get(&self, id: T::Id, policy: FetchPolicy) -> StoreResult<Option<T>> {
        match policy {
            FetchPolicy::CacheOnly => Ok(self.cache_get(&id)),
            FetchPolicy::CacheFirst => {
                if let Some(item) = self.cache_get(&id) {
                    return Ok(Some(item));
                }
                self.network_get_write_through(&id).await
            }
            FetchPolicy::NetworkOnly => self.network_get_write_through(&id).await,
            FetchPolicy::NetworkFirst => match self.via_breaker(self.backend.get(&id)).await {
                Ok(value) => {
                    if let Some(v) = &value {
                        self.cache.lock().unwrap().put(id.clone(), v.clone(), HashSet::new());
                    }
                    Ok(value)
                }
                Err(e) if e.retryable() => {
                    let mut cache = self.cache.lock().unwrap();
                    cache.invalidate(&[id.clone()]);
                    Ok(cache.get(&id).map(|entry| entry.item.clone()))
                }
                Err(e) => Err(e),
            },
            FetchPolicy::CacheAndNetwork => {
                let cached = self.cache_get(&id);
                if cached.is_some() {
                    self.spawn_background_refresh(id);
                    Ok(cached)
                } else {
                    self.network_get_write_through(&id).await
                }
            }
            FetchPolicy::StaleWhileRevalidate { .. } => {
                let cached = self.cache_get(&id);
                if cached.is_some() {
                    self.spawn_background_refresh(id);
                    Ok(cached)
                } else {
                    self.network_get_write_through(&id).await
                }
            }
        }
    }

    pub async fn get_all(&self, query: Query, policy: FetchPolicy) -> StoreResult<Vec<T>> {
        match policy {
            FetchPolicy::CacheOnly => Ok(self.cache_get_all(&query)),
            FetchPolicy::CacheFirst => {
                let cached = self.cache_get_all(&query);
                if !cached.is_empty() {
                    return Ok(cached);
                }
                self.network_get_all_write_through(&query).await
            }
            FetchPolicy::NetworkOnly => self.network_get_all_write_through(&query).await,
            FetchPolicy::NetworkFirst => match self.via_breaker(self.backend.get_all(&query)).await {
                Ok(items) => {
                    let mut cache = self.cache.lock().unwrap();
                    for item in &items {
                        cache.put(item.id(), item.clone(), HashSet::new());
                    }
                    Ok(items)
                }
                Err(e) if e.retryable() => {
                    let cache = self.cache.lock().unwrap();
                    Ok(query.evaluate(&cache.items_snapshot()))
                }
                Err(e) => Err(e),
            },
            FetchPolicy::CacheAndNetwork | FetchPolicy::StaleWhileRevalidate { .. } => {
                let cached = self.cache_get_all(&query);
                if !cached.is_empty() {
                    self.spawn_background_refresh_all(query.clone());
                    Ok(cached)
                } else {
                    self.network_get_all_write_through(&query).await
                }
            }
        }
    }

    pub async fn write(&self, item: T, tags: HashSet<String>, policy: WritePolicy) -> StoreResult<T> {
        let id = item.id();
        match policy {
            WritePolicy::CacheOnly => {
                self.cache.lock().unwrap().put(id, item.clone(), tags);
                Ok(item)
            }
            WritePolicy::NetworkFirst => {
                let saved = self.via_breaker(self.backend.save(item)).await?;
                self.cache.lock().unwrap().put(id, saved.clone(), tags);
                Ok(saved)
            }
            WritePolicy::CacheFirst => {
                let original = self.cache_get(&id);
                let op = if original.is_none() { ChangeOp::Create } else { ChangeOp::Update };
                self.cache.lock().unwrap().put(id.clone(), item.clone(), tags.clone());
                let change_id = self.pending.lock().unwrap().add(item.clone(), op, original);
                self.spawn_opportunistic_write(item.clone(), change_id);
                Ok(item)
            }
            WritePolicy::CacheAndNetwork => self.optimistic_write(item, tags).await,
        }
    }

    async fn optimistic_write(&self, item: T, tags: HashSet<String>) -> StoreResult<T> {
        let id = item.id();
        let original = self.cache_get(&id);
        let op = if original.is_none() { ChangeOp::Create } else { ChangeOp::Update };
        self.cache.lock().unwrap().put(id.clone(), item.clone(), tags.clone());
        let change_id = self.pending.lock().unwrap().add(item.clone(), op, original.clone());

        match self.via_breaker(self.backend.save(item.clone())).await {
            Ok(saved) => {
                self.cache.lock().unwrap().put(id, saved.clone(), tags);
                self.pending.lock().unwrap().remove(change_id);
                Ok(saved)
            }
            Err(StoreError::Conflict) => {
                self.pending.lock().unwrap().update(
                    change_id,
                    ChangeUpdate {
                        last_error: Some(Some(ErrorKind::Conflict)),
                        ..Default::default()
                    },
                );
                Err(StoreError::Conflict)
            }
            Err(e) if e.retryable() => {
                let kind = ErrorKind::from(&e);
                self.pending.lock().unwrap().update(
                    change_id,
                    ChangeUpdate {
                        last_error: Some(Some(kind)),
                        ..Default::default()
                    },
                );
                Ok(item)
            }
            Err(e) => {
                match original {
                    Some(orig) => self.cache.lock().unwrap().put(id, orig, tags),
                    None => {
                        self.cache.lock().unwrap().remove(&id);
                    }
                }
                self.pending.lock().unwrap().remove(change_id);
                Err(e)
            }
        }
    }

    fn spawn_opportunistic_write(&self, item: T, change_id: rds_pending::ChangeId) {
        let backend = Arc::clone(&self.backend);
        let pending = Arc::clone(&self.pending);
        let breaker = Arc::clone(&self.breaker);
        tokio::spawn(async move {
            if via_breaker(&breaker, backend.save(item)).await.is_ok() {
                pending.lock().unwrap().remove(change_id);
            }
        });
    }

    fn spawn_background_refresh(&self, id: T::Id) {
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let breaker = Arc::clone(&self.breaker);
        tokio::spawn(async move {
            if let Ok(Some(value)) = via_breaker(&breaker, backend.get(&id)).await {
                cache.lock().unwrap().put(id, value, HashSet::new());
            }
        });
    }

    fn spawn_background_refresh_all(&self, query: Query) {
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let breaker = Arc::clone(&self.breaker);
        tokio::spawn(async move {
            if let Ok(items) = via_breaker(&breaker, backend.get_all(&query)).await {
                let mut cache = cache.lock().unwrap();
                for item in items {
                    cache.put(item.id(), item, HashSet::new());
                }
            }
        });
    }

    async fn network_get_write_through(&self, id: &T::Id) -> StoreResult<Option<T>> {
        let cache = Arc::clone(&self.cache);
        let backend = Arc::clone(&self.backend);
        let breaker = Arc::clone(&self.breaker);
        let target = id.clone();
        let result = self
            .get_coalescer
            .run(id.clone(), async move {
                let value = via_breaker(&breaker, backend.get(&target)).await?;
                if let Some(v) = &value {
                    cache.lock().unwrap().put(target, v.clone(), HashSet::new());
                }
                Ok(value)
            })
            .await;
        Arc::try_unwrap(result).unwrap_or_else(|arc| clone_result(&arc))
    }

    async fn network_get_all_write_through(&self, query: &Query) -> StoreResult<Vec<T>> {
        let cache = Arc::clone(&self.cache);
        let backend = Arc::clone(&self.backend);
        let breaker = Arc::clone(&self.breaker);
        let fingerprint = query.fingerprint();
        let q = query.clone();
        let result = self
            .get_all_coalescer
            .run(fingerprint, async move {
                let items = via_breaker(&breaker, backend.get_all(&q)).await?;
                let mut cache = cache.lock().unwrap();
                for item in &items {
                    cache.put(item.id(), item.clone(), HashSet::new());
                }
                Ok(items)
            })
            .await;
        Arc::try_unwrap(result).unwrap_or_else(|arc| clone_result(&arc))
    }

    fn cache_get(&self, id: &T::Id) -> Option<T> {
        self.cache.lock().unwrap().get(id).map(|entry| entry.item.clone())
    }

    fn cache_get_all(&self, query: &Query) -> Vec<T> {
        let cache = self.cache.lock().unwrap();
        query.evaluate(&cache.items_snapshot())
    }
}

/// Admits a call through `breaker`, runs it, and records the outcome.
/// Free-standing so spawned tasks (which only hold an owned `Arc`, not
/// `&PolicyEngine`) can gate their own backend calls the same way.
async fn via_breaker<F, V>(breaker: &rds_breaker::CircuitBreaker, fut: F) -> StoreResult<V>
where
    F: Future<Output = StoreResult<V>>,
{
    let permit = breaker.admit().await?;
    match fut.await {
        Ok(v) => {
            breaker.record_success(permit).await;
            Ok(v)
        }
        Err(e) => {
            breaker.record_failure(permit).await;
            Err(e)
        }
    }
}

/// `StoreError` carries a non-`Clone` boxed cause, so a coalesced follower
/// that only has a shared reference reconstructs an equivalent error from
/// its `ErrorKind` and message rather than cloning it outright.
fn clone_result<T: Clone>(arc: &Arc<StoreResult<T>>) -> StoreResult<T> {
    match arc.as_ref() {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(StoreError::network(format!("coalesced: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::ValueMap;
    use rds_backend::{BackendCapabilities, HealthStatus, SyncStatus};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::watch;

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
        store: AsyncMutex<StdHashMap<String, Doc>>,
        fail_with: Option<fn() -> StoreError>,
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
            Ok(self.store.lock().await.get(id).cloned())
        }
        async fn get_all(&self, _query: &Query) -> StoreResult<Vec<Doc>> {
            Ok(self.store.lock().await.values().cloned().collect())
        }
        async fn save(&self, item: Doc) -> StoreResult<Doc> {
            if let Some(f) = self.fail_with {
                return Err(f());
            }
            self.store.lock().await.insert(item.id.clone(), item.clone());
            Ok(item)
        }
        async fn save_all(&self, items: Vec<Doc>) -> StoreResult<Vec<Doc>> {
            Ok(items)
        }
        async fn delete(&self, _id: &String) -> StoreResult<()> {
            Ok(())
        }
        async fn delete_all(&self, _ids: &[String]) -> StoreResult<()> {
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
        async fn health(&self) -> HealthStatus {
            HealthStatus::Healthy
        }
    }

    fn engine(fail_with: Option<fn() -> StoreError>) -> PolicyEngine<Doc> {
        PolicyEngine::new(
            Arc::new(StdMutex::new(Cache::new())),
            Arc::new(StdMutex::new(PendingQueue::new())),
            Arc::new(FakeBackend {
                store: AsyncMutex::new(StdHashMap::new()),
                fail_with,
            }),
            Arc::new(rds_breaker::CircuitBreaker::new(rds_breaker::BreakerConfig::default())),
        )
    }

    #[tokio::test]
    async fn cache_only_never_calls_backend_and_misses_return_none() {
        let engine = engine(None);
        let got = engine.get("missing".into(), FetchPolicy::CacheOnly).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn network_first_writes_through_on_success() {
        let engine = engine(None);
        engine
            .write(Doc { id: "d1".into(), body: "x".into() }, HashSet::new(), WritePolicy::NetworkFirst)
            .await
            .unwrap();
        let got = engine.get("d1".into(), FetchPolicy::CacheOnly).await.unwrap();
        assert_eq!(got.unwrap().body, "x");
    }

    #[tokio::test]
    async fn optimistic_write_reverts_on_non_retryable_non_conflict_error() {
        let engine = engine(Some(|| StoreError::validation(vec![])));
        engine
            .write(Doc { id: "d1".into(), body: "original".into() }, HashSet::new(), WritePolicy::CacheOnly)
            .await
            .unwrap();

        let result = engine
            .write(Doc { id: "d1".into(), body: "new".into() }, HashSet::new(), WritePolicy::CacheAndNetwork)
            .await;
        assert!(result.is_err());
        let got = engine.get("d1".into(), FetchPolicy::CacheOnly).await.unwrap();
        assert_eq!(got.unwrap().body, "original");
    }

    #[tokio::test]
    async fn optimistic_write_keeps_value_on_retryable_error() {
        let engine = engine(Some(|| StoreError::network("down")));
        let saved = engine
            .write(Doc { id: "d1".into(), body: "new".into() }, HashSet::new(), WritePolicy::CacheAndNetwork)
            .await
            .unwrap();
        assert_eq!(saved.body, "new");
        let got = engine.get("d1".into(), FetchPolicy::CacheOnly).await.unwrap();
        assert_eq!(got.unwrap().body, "new");
    }

    #[tokio::test]
    async fn conflict_leaves_pending_marked_and_surfaces_error() {
        let engine = engine(Some(|| StoreError::Conflict));
        let result = engine
            .write(Doc { id: "d1".into(), body: "new".into() }, HashSet::new(), WritePolicy::CacheAndNetwork)
            .await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }
}
