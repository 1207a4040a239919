//! `Store<T>`: the public façade (spec §4.12, C12) wiring cache, pending
//! queue, reactive registry, policy engine, conflict service, and circuit
//! breaker into one handle per entity type. Grounded on `mqk-daemon`'s
//! `AppState` — one struct of `Arc`-wrapped shared subsystems, built once
//! at startup and handed out to every request handler — generalized here
//! from "one process-wide state" to "one `Store` per entity type", which a
//! host application constructs as many of as it has domain types.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use rds_backend::{Backend, HealthStatus, SyncStatus};
use rds_breaker::{CircuitBreaker, CircuitState};
use rds_cache::Cache;
use rds_conflict::{ConflictAction, ConflictDetails, ConflictResolver, ConflictService};
use rds_entity::Entity;
use rds_error::{ErrorKind, ErrorSink, StoreError, StoreResult};
use rds_pagination::{PageFetcher, PaginationController};
use rds_pending::{ChangeId, ChangeOp, ChangeUpdate, PendingChange, PendingQueue};
use rds_policy::{FetchPolicy, PolicyEngine, WritePolicy};
use rds_query::Query;
use rds_reactive::{IdWatch, QueryWatch, ReactiveRegistry};
use tokio::sync::{broadcast, watch};

use crate::config::{RetryConfig, StoreConfig, TracingErrorSink};
use crate::health;
use crate::pool_metrics::PoolMetricsSource;

/// Forwards page fetches through the store's backend and circuit breaker
/// (spec §5: "any backend call" is a sanctioned suspension point gated by
/// the breaker, and pagination's page fetch is no exception).
struct BackendPageFetcher<T: Entity> {
    backend: Arc<dyn Backend<T>>,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait::async_trait]
impl<T: Entity> PageFetcher<T> for BackendPageFetcher<T> {
    async fn fetch_page(&self, query: &Query) -> StoreResult<Vec<T>> {
        let permit = self.breaker.admit().await?;
        match self.backend.get_all(query).await {
            Ok(items) => {
                self.breaker.record_success(permit).await;
                Ok(items)
            }
            Err(e) => {
                self.breaker.record_failure(permit).await;
                Err(e)
            }
        }
    }
}

/// One reactive data store for entity type `T` (spec §4.12). Cheap to
/// clone-by-reference: hosts share one `Arc<Store<T>>` across tasks rather
/// than cloning the struct itself.
pub struct Store<T: Entity> {
    cache: Arc<StdMutex<Cache<T>>>,
    pending: Arc<StdMutex<PendingQueue<T>>>,
    registry: Arc<ReactiveRegistry<T>>,
    policy: PolicyEngine<T>,
    conflicts: ConflictService<T>,
    breaker: Arc<CircuitBreaker>,
    backend: Arc<dyn Backend<T>>,
    retry: RetryConfig,
    default_fetch_policy: FetchPolicy,
    default_write_policy: WritePolicy,
    error_sink: Arc<dyn ErrorSink>,
    pool_metrics_source: Option<Arc<dyn PoolMetricsSource>>,
    sync_status_tx: watch::Sender<SyncStatus>,
    closed: AtomicBool,
}

impl<T: Entity> Store<T> {
    pub fn new(backend: Arc<dyn Backend<T>>, config: StoreConfig) -> Self {
        Self::with_resolver(backend, config, None)
    }

    /// Spawns a task that forwards the backend's raw `sync_status()` stream
    /// onto the façade's own channel (SPEC_FULL §2: the façade "re-exports
    /// the backend's stream and additionally derives a `SyncStatus::Error`
    /// transition" — `sync()` overrides this channel directly when it sees
    /// the breaker open or a change go terminal, which a plain passthrough
    /// couldn't do).
    pub fn with_resolver(
        backend: Arc<dyn Backend<T>>,
        config: StoreConfig,
        resolver: Option<Arc<dyn ConflictResolver<T>>>,
    ) -> Self {
        let cache = Arc::new(StdMutex::new(Cache::new()));
        let pending = Arc::new(StdMutex::new(PendingQueue::new()));
        let registry = Arc::new(ReactiveRegistry::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let policy = PolicyEngine::new(
            Arc::clone(&cache),
            Arc::clone(&pending),
            Arc::clone(&backend),
            Arc::clone(&breaker),
        );
        let conflicts = ConflictService::new(config.conflict.clone(), resolver);

        let mut backend_status = backend.sync_status();
        let (sync_status_tx, _rx) = watch::channel(*backend_status.borrow());
        let forward_tx = sync_status_tx.clone();
        tokio::spawn(async move {
            while backend_status.changed().await.is_ok() {
                if forward_tx.send(*backend_status.borrow()).is_err() {
                    break;
                }
            }
        });

        Self {
            cache,
            pending,
            registry,
            policy,
            conflicts,
            breaker,
            backend,
            retry: config.retry,
            default_fetch_policy: config.default_fetch_policy,
            default_write_policy: config.default_write_policy,
            error_sink: Arc::new(TracingErrorSink),
            pool_metrics_source: None,
            sync_status_tx,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    #[must_use]
    pub fn with_pool_metrics_source(mut self, source: Arc<dyn PoolMetricsSource>) -> Self {
        self.pool_metrics_source = Some(source);
        self
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::illegal_state("store is closed"))
        } else {
            Ok(())
        }
    }

    async fn via_breaker<F, V>(&self, fut: F) -> StoreResult<V>
    where
        F: Future<Output = StoreResult<V>>,
    {
        let permit = self.breaker.admit().await?;
        match fut.await {
            Ok(v) => {
                self.breaker.record_success(permit).await;
                Ok(v)
            }
            Err(e) => {
                self.breaker.record_failure(permit).await;
                Err(e)
            }
        }
    }

    fn cache_get(&self, id: &T::Id) -> Option<T> {
        self.cache.lock().unwrap().get(id).map(|e| e.item.clone())
    }

    /// Emits the new value to `id`'s reactive channel and re-evaluates
    /// every active query channel (spec §4.8, called after every mutation).
    fn notify_after_mutation(&self, id: &T::Id) {
        let (current, all) = {
            let cache = self.cache.lock().unwrap();
            (cache.get(id).map(|e| e.item.clone()), cache.items_snapshot())
        };
        self.registry.notify(id, current, &all);
    }

    pub async fn initialize(&self) -> StoreResult<()> {
        self.backend.initialize().await
    }

    /// Idempotent: closes the backend once and marks the store unusable
    /// for further reads/writes (spec §4.12, §7 "fatal errors ... close()
    /// must be called").
    pub async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.close().await
    }

    pub async fn get(&self, id: T::Id, policy: Option<FetchPolicy>) -> StoreResult<Option<T>> {
        self.ensure_open()?;
        let policy = policy.unwrap_or(self.default_fetch_policy);
        let result = self.policy.get(id, policy).await;
        if let Err(e) = &result {
            self.error_sink.observe(e);
        }
        result
    }

    pub async fn get_all(&self, query: Option<Query>, policy: Option<FetchPolicy>) -> StoreResult<Vec<T>> {
        self.ensure_open()?;
        let query = query.unwrap_or_default();
        let policy = policy.unwrap_or(self.default_fetch_policy);
        let result = self.policy.get_all(query, policy).await;
        if let Err(e) = &result {
            self.error_sink.observe(e);
        }
        result
    }

    pub fn watch(self: &Arc<Self>, id: T::Id) -> IdWatch<T> {
        let current = self.cache_get(&id);
        self.registry.watch(id, current)
    }

    pub fn watch_all(self: &Arc<Self>, query: Option<Query>) -> QueryWatch<T> {
        let query = query.unwrap_or_default();
        let current = query.evaluate(&self.cache.lock().unwrap().items_snapshot());
        self.registry.watch_all(query, current)
    }

    /// Builds a `PaginationController` over this store's backend and fires
    /// off its first-page load (spec §4.9: "first page loads on
    /// subscription"). The caller drives further pages via the returned
    /// controller's `watch()`/`load_more()`.
    pub fn watch_paginated(
        &self,
        query: Query,
        page_size: usize,
        prefetch_distance: usize,
        max_pages_in_memory: Option<usize>,
    ) -> Arc<PaginationController<T, BackendPageFetcher<T>>> {
        let fetcher = BackendPageFetcher {
            backend: Arc::clone(&self.backend),
            breaker: Arc::clone(&self.breaker),
        };
        let controller = Arc::new(PaginationController::new(
            query,
            page_size,
            prefetch_distance,
            max_pages_in_memory,
            fetcher,
        ));
        let started = Arc::clone(&controller);
        tokio::spawn(async move {
            started.start().await;
        });
        controller
    }

    pub async fn save(&self, item: T, tags: Option<HashSet<String>>) -> StoreResult<T> {
        self.ensure_open()?;
        let id = item.id();
        let local = item.clone();
        let policy = self.default_write_policy;
        let outcome = self.policy.write(item, tags.unwrap_or_default(), policy).await;
        self.notify_after_mutation(&id);
        match outcome {
            Err(StoreError::Conflict) => {
                self.error_sink.observe(&StoreError::Conflict);
                self.resolve_conflict(local).await
            }
            Err(e) => {
                self.error_sink.observe(&e);
                Err(e)
            }
            Ok(v) => Ok(v),
        }
    }

    pub async fn save_all(&self, items: Vec<T>, tags: Option<HashSet<String>>) -> StoreResult<Vec<T>> {
        let mut saved = Vec::with_capacity(items.len());
        for item in items {
            saved.push(self.save(item, tags.clone()).await?);
        }
        Ok(saved)
    }

    pub async fn delete(&self, id: T::Id) -> StoreResult<()> {
        self.ensure_open()?;
        let original = self.cache_get(&id);
        self.cache.lock().unwrap().remove(&id);
        let change_id = original
            .clone()
            .map(|orig| self.pending.lock().unwrap().add(orig.clone(), ChangeOp::Delete, Some(orig)));
        self.notify_after_mutation(&id);

        let result = self.via_breaker(self.backend.delete(&id)).await;
        match &result {
            Ok(()) => {
                if let Some(cid) = change_id {
                    self.pending.lock().unwrap().remove(cid);
                }
            }
            Err(e) if e.retryable() => {
                if let Some(cid) = change_id {
                    self.pending.lock().unwrap().update(
                        cid,
                        ChangeUpdate {
                            last_error: Some(Some(ErrorKind::from(e))),
                            last_attempt: Some(Some(std::time::Instant::now())),
                            ..Default::default()
                        },
                    );
                }
            }
            Err(_) => {
                if let Some(orig) = original {
                    self.cache.lock().unwrap().put(id.clone(), orig, HashSet::new());
                }
                if let Some(cid) = change_id {
                    self.pending.lock().unwrap().remove(cid);
                }
                self.notify_after_mutation(&id);
            }
        }
        if let Err(e) = &result {
            self.error_sink.observe(e);
        }
        result
    }

    pub async fn delete_all(&self, ids: Vec<T::Id>) -> StoreResult<()> {
        for id in ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    pub async fn delete_where(&self, query: Query) -> StoreResult<u64> {
        self.ensure_open()?;
        let result = self.via_breaker(self.backend.delete_where(&query)).await;
        if result.is_ok() {
            let matches: Vec<T::Id> = {
                let cache = self.cache.lock().unwrap();
                query.evaluate(&cache.items_snapshot()).iter().map(Entity::id).collect()
            };
            {
                let mut cache = self.cache.lock().unwrap();
                for id in &matches {
                    cache.remove(id);
                }
            }
            for id in &matches {
                self.notify_after_mutation(id);
            }
        }
        if let Err(e) = &result {
            self.error_sink.observe(e);
        }
        result
    }

    pub fn invalidate(&self, id: T::Id) {
        self.cache.lock().unwrap().invalidate(std::slice::from_ref(&id));
    }

    pub fn invalidate_by_ids(&self, ids: Vec<T::Id>) {
        self.cache.lock().unwrap().invalidate(&ids);
    }

    pub fn invalidate_by_tags(&self, tags: Vec<String>) {
        self.cache.lock().unwrap().invalidate_by_tags(&tags);
    }

    pub fn invalidate_where(&self, query: Query) {
        self.cache.lock().unwrap().invalidate_where(&query);
    }

    /// Fetches the remote value, routes it through the conflict service,
    /// and applies the resulting action to cache and pending state (spec
    /// §4.11). Called whenever `write()` reports `StoreError::Conflict`.
    async fn resolve_conflict(&self, local: T) -> StoreResult<T> {
        let id = local.id();
        let remote = match self.via_breaker(self.backend.get(&id)).await {
            Ok(Some(remote)) => remote,
            Ok(None) => return Err(StoreError::Conflict),
            Err(e) => return Err(e),
        };

        let details = ConflictDetails {
            local: local.clone(),
            remote: remote.clone(),
            local_ts: Utc::now(),
            remote_ts: Utc::now(),
            conflicting_fields: None,
        };
        let action = self.conflicts.handle(details).await;
        let resolved = match action {
            ConflictAction::KeepLocal => local,
            ConflictAction::KeepRemote => remote,
            ConflictAction::Merge(merged) => merged,
            ConflictAction::Skip => return Err(StoreError::Conflict),
        };

        self.cache.lock().unwrap().put(id.clone(), resolved.clone(), HashSet::new());
        self.clear_conflicted_pending(&id);
        self.notify_after_mutation(&id);
        Ok(resolved)
    }

    fn clear_conflicted_pending(&self, id: &T::Id) {
        let mut pending = self.pending.lock().unwrap();
        for change in pending.by_entity(id) {
            if change.last_error == Some(ErrorKind::Conflict) {
                pending.remove(change.change_id);
            }
        }
    }

    /// Drives one pass of the pending-change queue through the backend,
    /// honoring the circuit breaker and `RetryConfig` backoff (spec §4.12,
    /// §5). Changes whose backoff hasn't elapsed, or whose retry budget is
    /// exhausted, are left untouched for the next call.
    pub async fn sync(&self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.breaker.current_state() == CircuitState::Open {
            let _ = self.sync_status_tx.send(SyncStatus::Error);
            return Ok(());
        }
        let snapshot = self.pending.lock().unwrap().snapshot();
        for change in snapshot {
            if self.retry.exhausted(change.retry_count) {
                continue;
            }
            if let Some(last_attempt) = change.last_attempt {
                if last_attempt.elapsed() < self.retry.delay(change.retry_count) {
                    continue;
                }
            }
            self.sync_one(change).await;
        }
        Ok(())
    }

    async fn sync_one(&self, change: PendingChange<T>) {
        let id = change.entity_id();
        let result: StoreResult<T> = match change.op {
            ChangeOp::Delete => self
                .via_breaker(self.backend.delete(&id))
                .await
                .map(|()| change.item.clone()),
            ChangeOp::Create | ChangeOp::Update => {
                self.via_breaker(self.backend.save(change.item.clone())).await
            }
        };

        match result {
            Ok(saved) => {
                if change.op != ChangeOp::Delete {
                    self.cache.lock().unwrap().put(id.clone(), saved, HashSet::new());
                }
                self.pending.lock().unwrap().remove(change.change_id);
                self.notify_after_mutation(&id);
            }
            Err(StoreError::Conflict) => {
                self.pending.lock().unwrap().update(
                    change.change_id,
                    ChangeUpdate {
                        last_error: Some(Some(ErrorKind::Conflict)),
                        last_attempt: Some(Some(std::time::Instant::now())),
                        retry_count: Some(change.retry_count + 1),
                    },
                );
                let _ = self.resolve_conflict(change.item.clone()).await;
            }
            Err(e) => {
                self.error_sink.observe(&e);
                let next_retry_count = change.retry_count + 1;
                self.pending.lock().unwrap().update(
                    change.change_id,
                    ChangeUpdate {
                        last_error: Some(Some(ErrorKind::from(&e))),
                        last_attempt: Some(Some(std::time::Instant::now())),
                        retry_count: Some(next_retry_count),
                    },
                );
                if self.retry.exhausted(next_retry_count) {
                    let _ = self.sync_status_tx.send(SyncStatus::Error);
                }
            }
        }
    }

    pub fn pending_changes(&self) -> watch::Receiver<Vec<PendingChange<T>>> {
        self.pending.lock().unwrap().watch()
    }

    pub fn conflicts(&self) -> broadcast::Receiver<ConflictDetails<T>> {
        self.conflicts.subscribe()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync_status_tx.subscribe()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.current_state()
    }

    pub async fn pool_metrics(&self) -> Option<rds_pool::PoolMetrics> {
        match &self.pool_metrics_source {
            Some(source) => Some(source.pool_metrics().await),
            None => None,
        }
    }

    /// Folds pool, breaker, and backend health into one status via the
    /// `Healthy < Degraded < Unhealthy` total order (spec §3, §4.12).
    pub async fn health_status(&self) -> HealthStatus {
        let breaker = health::breaker_health(self.breaker.current_state());
        let backend = self.backend.health().await;
        let pool = match &self.pool_metrics_source {
            Some(source) => health::pool_health(&source.pool_metrics().await),
            None => HealthStatus::Healthy,
        };
        breaker.max(backend).max(pool)
    }

    /// Marks a change (or, with `None`, every failed change) due for
    /// immediate retry on the next `sync()`. Returns how many changes were
    /// touched.
    pub fn retry_pending(&self, change_id: Option<ChangeId>) -> usize {
        let mut pending = self.pending.lock().unwrap();
        match change_id {
            Some(cid) => {
                let touched = pending.update(
                    cid,
                    ChangeUpdate {
                        last_attempt: Some(None),
                        ..Default::default()
                    },
                );
                if touched {
                    1
                } else {
                    0
                }
            }
            None => pending.retry_all(),
        }
    }

    /// Cancels a pending change, reverting the cache to its pre-change
    /// `original` (or removing it entirely for an un-revertible create),
    /// and returns that original value (spec §4.5).
    pub fn cancel_pending(&self, change_id: ChangeId) -> Option<T> {
        let mut pending = self.pending.lock().unwrap();
        let id = pending.get(change_id)?.entity_id();
        let original = pending.cancel(change_id);
        drop(pending);

        match &original {
            Some(orig) => self.cache.lock().unwrap().put(id.clone(), orig.clone(), HashSet::new()),
            None => {
                self.cache.lock().unwrap().remove(&id);
            }
        }
        self.notify_after_mutation(&id);
        original
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::ValueMap;
    use rds_testkit::InMemoryBackend;
    use serde::{Deserialize, Serialize};

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

    fn store() -> Store<Doc> {
        let backend: Arc<dyn Backend<Doc>> = Arc::new(InMemoryBackend::new());
        Store::new(backend, StoreConfig::default())
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let s = store();
        s.save(Doc { id: "d1".into(), body: "hello".into() }, None).await.unwrap();
        let got = s.get("d1".into(), Some(FetchPolicy::CacheOnly)).await.unwrap();
        assert_eq!(got.unwrap().body, "hello");
    }

    #[tokio::test]
    async fn delete_removes_from_cache() {
        let s = store();
        s.save(Doc { id: "d1".into(), body: "x".into() }, None).await.unwrap();
        s.delete("d1".into()).await.unwrap();
        let got = s.get("d1".into(), Some(FetchPolicy::CacheOnly)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn watch_sees_value_written_after_subscription() {
        let s = Arc::new(store());
        let mut w = s.watch("d1".to_string());
        assert!(w.current().is_none());
        s.save(Doc { id: "d1".into(), body: "v1".into() }, None).await.unwrap();
        w.receiver().changed().await.unwrap();
        assert_eq!(w.current().unwrap().body, "v1");
    }

    #[tokio::test]
    async fn closed_store_rejects_further_writes() {
        let s = store();
        s.close().await.unwrap();
        let result = s.save(Doc { id: "d1".into(), body: "x".into() }, None).await;
        assert!(matches!(result, Err(StoreError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn cancel_pending_reverts_to_original() {
        let s = store();
        s.save(Doc { id: "d1".into(), body: "original".into() }, None).await.unwrap();
        let change_id = {
            let mut pending = s.pending.lock().unwrap();
            pending.add(
                Doc { id: "d1".into(), body: "edited".into() },
                ChangeOp::Update,
                Some(Doc { id: "d1".into(), body: "original".into() }),
            )
        };
        s.cache.lock().unwrap().put("d1".into(), Doc { id: "d1".into(), body: "edited".into() }, HashSet::new());

        let reverted = s.cancel_pending(change_id).unwrap();
        assert_eq!(reverted.body, "original");
        let got = s.get("d1".into(), Some(FetchPolicy::CacheOnly)).await.unwrap();
        assert_eq!(got.unwrap().body, "original");
    }

    #[tokio::test]
    async fn health_status_is_healthy_with_no_pool_source_and_closed_breaker() {
        let s = store();
        assert_eq!(s.health_status().await, HealthStatus::Healthy);
    }
}
