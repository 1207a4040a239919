//! rds-reactive
//!
//! Keyed reactive channels (spec §4.8, C8): `watch(id)` and `watch_all
//! (query)`, each replaying its latest value to new subscribers. Grounded
//! on `mqk-daemon`'s `AppState` (one shared, `Clone`-able handle over a
//! `broadcast::Sender<BusMsg>` every Axum handler reads from) —
//! generalized from a single flat bus keyed by nothing into many keyed
//! slots (one per entity id, one per query fingerprint), and from
//! `broadcast` (no replay) to `watch` (replay-on-subscribe), since spec
//! §4.8's "seeded subject semantics" requires late subscribers to see the
//! current value immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rds_entity::Entity;
use rds_query::Query;
use tokio::sync::watch;

struct Slot<V> {
    tx: watch::Sender<V>,
    refcount: usize,
}

struct Inner<T: Entity> {
    by_id: HashMap<T::Id, Slot<Option<T>>>,
    by_query: HashMap<u64, (Query, Slot<Vec<T>>)>,
}

impl<T: Entity> Default for Inner<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_query: HashMap::new(),
        }
    }
}

/// Owns every live `watch(id)` / `watch_all(query)` channel for one store.
/// All bookkeeping here is synchronous and non-suspending, per spec §5:
/// "tag-index lookups MUST NOT suspend" applies equally to registry
/// lookups.
pub struct ReactiveRegistry<T: Entity> {
    inner: Mutex<Inner<T>>,
}

impl<T: Entity> Default for ReactiveRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> ReactiveRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Subscribes to the `id` channel, creating it (seeded with `current`)
    /// if this is the first subscriber.
    pub fn watch(self: &Arc<Self>, id: T::Id, current: Option<T>) -> IdWatch<T> {
        let mut inner = self.inner.lock().unwrap();
        let rx = match inner.by_id.get_mut(&id) {
            Some(slot) => {
                slot.refcount += 1;
                slot.tx.subscribe()
            }
            None => {
                let (tx, rx) = watch::channel(current);
                inner.by_id.insert(id.clone(), Slot { tx, refcount: 1 });
                rx
            }
        };
        drop(inner);
        IdWatch {
            id,
            registry: Arc::clone(self),
            rx,
        }
    }

    /// Subscribes to the `watch_all(query)` channel keyed by the query's
    /// fingerprint, creating it (seeded with `current`) if needed.
    pub fn watch_all(self: &Arc<Self>, query: Query, current: Vec<T>) -> QueryWatch<T> {
        let fingerprint = query.fingerprint();
        let mut inner = self.inner.lock().unwrap();
        let rx = match inner.by_query.get_mut(&fingerprint) {
            Some((_, slot)) => {
                slot.refcount += 1;
                slot.tx.subscribe()
            }
            None => {
                let (tx, rx) = watch::channel(current);
                inner
                    .by_query
                    .insert(fingerprint, (query, Slot { tx, refcount: 1 }));
                rx
            }
        };
        drop(inner);
        QueryWatch {
            fingerprint,
            registry: Arc::clone(self),
            rx,
        }
    }

    /// Called after every save/delete/merge (spec §4.8): emits the new
    /// value to the `id` channel (if one exists), then re-evaluates every
    /// active query channel against `all_entities` and emits only the
    /// lists that actually changed.
    pub fn notify(&self, id: &T::Id, new_value: Option<T>, all_entities: &[T]) {
        let inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.by_id.get(id) {
            let _ = slot.tx.send(new_value);
        }
        for (query, slot) in inner.by_query.values() {
            let recomputed = query.evaluate(all_entities);
            let changed = { *slot.tx.borrow() != recomputed };
            if changed {
                let _ = slot.tx.send(recomputed);
            }
        }
    }

    pub fn active_id_channels(&self) -> usize {
        self.inner.lock().unwrap().by_id.len()
    }

    pub fn active_query_channels(&self) -> usize {
        self.inner.lock().unwrap().by_query.len()
    }

    fn release_id(&self, id: &T::Id) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.by_id.get_mut(id) {
            slot.refcount -= 1;
            if slot.refcount == 0 {
                inner.by_id.remove(id);
            }
        }
    }

    fn release_query(&self, fingerprint: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, slot)) = inner.by_query.get_mut(&fingerprint) {
            slot.refcount -= 1;
            if slot.refcount == 0 {
                inner.by_query.remove(&fingerprint);
            }
        }
    }
}

/// A live subscription to `watch(id)`. Dropping the last handle for an id
/// removes the channel from the registry (spec §4.8 lifecycle).
pub struct IdWatch<T: Entity> {
    id: T::Id,
    registry: Arc<ReactiveRegistry<T>>,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Entity> IdWatch<T> {
    pub fn receiver(&mut self) -> &mut watch::Receiver<Option<T>> {
        &mut self.rx
    }

    pub fn current(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

impl<T: Entity> Drop for IdWatch<T> {
    fn drop(&mut self) {
        self.registry.release_id(&self.id);
    }
}

/// A live subscription to `watch_all(query)`.
pub struct QueryWatch<T: Entity> {
    fingerprint: u64,
    registry: Arc<ReactiveRegistry<T>>,
    rx: watch::Receiver<Vec<T>>,
}

impl<T: Entity> QueryWatch<T> {
    pub fn receiver(&mut self) -> &mut watch::Receiver<Vec<T>> {
        &mut self.rx
    }

    pub fn current(&self) -> Vec<T> {
        self.rx.borrow().clone()
    }
}

impl<T: Entity> Drop for QueryWatch<T> {
    fn drop(&mut self) {
        self.registry.release_query(self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::{to_value_map_via_serde, ValueMap};
    use rds_query::Op;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: String,
        team: String,
    }

    impl Entity for User {
        type Id = String;
        fn id(&self) -> Self::Id {
            self.id.clone()
        }
        fn to_value_map(&self) -> ValueMap {
            to_value_map_via_serde(self).unwrap()
        }
        fn from_value_map(map: ValueMap) -> rds_error::StoreResult<Self> {
            rds_entity::from_value_map_via_serde(map)
        }
    }

    #[tokio::test]
    async fn new_subscriber_is_seeded_with_current_value() {
        let registry = Arc::new(ReactiveRegistry::<User>::new());
        let u = User { id: "u1".into(), team: "x".into() };
        let mut handle = registry.watch("u1".into(), Some(u.clone()));
        assert_eq!(*handle.receiver().borrow(), Some(u));
    }

    #[tokio::test]
    async fn notify_emits_only_to_id_channel_that_exists() {
        let registry = Arc::new(ReactiveRegistry::<User>::new());
        let mut handle = registry.watch("u1".into(), None);
        let u = User { id: "u1".into(), team: "x".into() };
        registry.notify(&"u1".to_string(), Some(u.clone()), &[u.clone()]);
        handle.receiver().changed().await.unwrap();
        assert_eq!(*handle.receiver().borrow(), Some(u));
    }

    #[tokio::test]
    async fn dropping_last_handle_removes_channel() {
        let registry = Arc::new(ReactiveRegistry::<User>::new());
        let handle = registry.watch("u1".into(), None);
        assert_eq!(registry.active_id_channels(), 1);
        drop(handle);
        assert_eq!(registry.active_id_channels(), 0);
    }

    #[tokio::test]
    async fn query_channel_only_emits_when_result_changes() {
        let registry = Arc::new(ReactiveRegistry::<User>::new());
        let query = Query::new().r#where("team", Op::Eq, "x");
        let mut handle = registry.watch_all(query, Vec::new());

        let u = User { id: "u1".into(), team: "x".into() };
        registry.notify(&"u1".to_string(), Some(u.clone()), &[u.clone()]);
        handle.receiver().changed().await.unwrap();
        assert_eq!(handle.current(), vec![u.clone()]);

        // Same snapshot again: result is identical, so no new emission.
        registry.notify(&"u1".to_string(), Some(u.clone()), &[u]);
        assert!(!handle.receiver().has_changed().unwrap());
    }
}
