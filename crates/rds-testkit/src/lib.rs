//! rds-testkit
//!
//! An in-memory `Backend` implementation and fixtures shared by the rest
//! of the workspace's test suites. Grounded on `mqk-testkit`'s
//! `PaperBroker`/`FakeBroker` (deterministic, idempotent-by-key
//! fixtures used in place of a real broker — "no randomness, no
//! timestamps") for the general shape of an in-memory test double.
//! `FaultInjection`'s named failure modes have no precedent there or
//! anywhere else in the pack — both fixtures are either always-succeed
//! or dedup-only, with no injectable failure mechanism — so this is a
//! novel addition built for this workspace's own test needs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rds_backend::{Backend, BackendCapabilities, HealthStatus, SyncStatus};
use rds_entity::Entity;
use rds_error::{StoreError, StoreResult};
use rds_query::Query;
use tokio::sync::watch;

/// What `InMemoryBackend` should do on the next call to `save`/`get`, set
/// by tests to exercise retry/rollback/conflict paths.
#[derive(Clone, Debug, Default)]
pub struct FaultInjection {
    pub fail_next_save: Option<StoreErrorKind>,
    pub fail_next_get: Option<StoreErrorKind>,
    pub latency: Option<Duration>,
}

/// A `Clone`-friendly stand-in for the `StoreError` variants tests most
/// commonly want to inject.
#[derive(Clone, Copy, Debug)]
pub enum StoreErrorKind {
    Network,
    Conflict,
    Validation,
}

impl StoreErrorKind {
    fn into_error(self) -> StoreError {
        match self {
            StoreErrorKind::Network => StoreError::network("injected failure"),
            StoreErrorKind::Conflict => StoreError::Conflict,
            StoreErrorKind::Validation => StoreError::validation(vec![]),
        }
    }
}

pub struct InMemoryBackend<T: Entity> {
    store: Mutex<HashMap<T::Id, T>>,
    faults: Mutex<FaultInjection>,
    sync_status_tx: watch::Sender<SyncStatus>,
    capabilities: BackendCapabilities,
}

impl<T: Entity> Default for InMemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> InMemoryBackend<T> {
    pub fn new() -> Self {
        let (sync_status_tx, _rx) = watch::channel(SyncStatus::Idle);
        Self {
            store: Mutex::new(HashMap::new()),
            faults: Mutex::new(FaultInjection::default()),
            sync_status_tx,
            capabilities: BackendCapabilities {
                supports_offline: true,
                supports_realtime: false,
                supports_transactions: false,
                supports_pagination: true,
                supports_field_ops: false,
                supports_crdt: false,
            },
        }
    }

    pub fn seed(&self, items: impl IntoIterator<Item = T>) {
        let mut store = self.store.lock().unwrap();
        for item in items {
            store.insert(item.id(), item);
        }
    }

    pub fn inject(&self, faults: FaultInjection) {
        *self.faults.lock().unwrap() = faults;
    }

    async fn maybe_sleep(&self) {
        let latency = self.faults.lock().unwrap().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    fn take_fault(&self, pick: impl Fn(&mut FaultInjection) -> Option<StoreErrorKind>) -> Option<StoreErrorKind> {
        pick(&mut self.faults.lock().unwrap())
    }
}

#[async_trait::async_trait]
impl<T: Entity> Backend<T> for InMemoryBackend<T> {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, id: &T::Id) -> StoreResult<Option<T>> {
        self.maybe_sleep().await;
        if let Some(kind) = self.take_fault(|f| f.fail_next_get.take()) {
            return Err(kind.into_error());
        }
        Ok(self.store.lock().unwrap().get(id).cloned())
    }

    async fn get_all(&self, query: &Query) -> StoreResult<Vec<T>> {
        self.maybe_sleep().await;
        let snapshot: Vec<T> = self.store.lock().unwrap().values().cloned().collect();
        Ok(query.evaluate(&snapshot))
    }

    async fn save(&self, item: T) -> StoreResult<T> {
        self.maybe_sleep().await;
        if let Some(kind) = self.take_fault(|f| f.fail_next_save.take()) {
            return Err(kind.into_error());
        }
        self.store.lock().unwrap().insert(item.id(), item.clone());
        Ok(item)
    }

    async fn save_all(&self, items: Vec<T>) -> StoreResult<Vec<T>> {
        let mut store = self.store.lock().unwrap();
        for item in &items {
            store.insert(item.id(), item.clone());
        }
        Ok(items)
    }

    async fn delete(&self, id: &T::Id) -> StoreResult<()> {
        self.store.lock().unwrap().remove(id);
        Ok(())
    }

    async fn delete_all(&self, ids: &[T::Id]) -> StoreResult<()> {
        let mut store = self.store.lock().unwrap();
        for id in ids {
            store.remove(id);
        }
        Ok(())
    }

    async fn delete_where(&self, query: &Query) -> StoreResult<u64> {
        let mut store = self.store.lock().unwrap();
        let snapshot: Vec<T> = store.values().cloned().collect();
        let matches = query.evaluate(&snapshot);
        for item in &matches {
            store.remove(&item.id());
        }
        Ok(matches.len() as u64)
    }

    fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync_status_tx.subscribe()
    }

    async fn pending_changes_count(&self) -> u64 {
        0
    }

    async fn sync(&self) -> StoreResult<()> {
        let _ = self.sync_status_tx.send(SyncStatus::Synced);
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::ValueMap;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        n: i64,
    }

    impl Entity for Row {
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

    #[tokio::test]
    async fn seed_then_get_round_trips() {
        let backend = InMemoryBackend::<Row>::new();
        backend.seed([Row { id: "r1".into(), n: 1 }]);
        let got = backend.get(&"r1".to_string()).await.unwrap();
        assert_eq!(got.unwrap().n, 1);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let backend = InMemoryBackend::<Row>::new();
        backend.inject(FaultInjection {
            fail_next_save: Some(StoreErrorKind::Conflict),
            ..Default::default()
        });
        let first = backend.save(Row { id: "r1".into(), n: 1 }).await;
        assert!(matches!(first, Err(StoreError::Conflict)));
        let second = backend.save(Row { id: "r1".into(), n: 2 }).await;
        assert!(second.is_ok());
    }
}
