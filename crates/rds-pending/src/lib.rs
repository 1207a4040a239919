//! rds-pending
//!
//! Pending-change queue (spec §4.5, C5): an insertion-ordered log of
//! outgoing mutations with retry/undo, indexed by `change_id` and secondary-
//! indexed by entity id. Modeled after the outbox pattern in `mqk-db`
//! (`scenario_outbox_*` tests: insert-then-claim, idempotency,
//! claim-lock preventing double dispatch) — generalized here from a SQL
//! outbox table into an in-memory queue the core owns directly, since this
//! crate's job is bookkeeping and emission, not persistence (spec §6 leaves
//! persistence to the backend or an injected store).

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rds_entity::Entity;
use rds_error::ErrorKind;
use tokio::sync::watch;
use uuid::Uuid;

pub type ChangeId = Uuid;

/// The three mutation kinds a pending change can represent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// A mutation applied locally but not yet acknowledged by the backend
/// (GLOSSARY: "Pending change").
#[derive(Clone, Debug)]
pub struct PendingChange<T: Entity> {
    pub change_id: ChangeId,
    pub item: T,
    pub op: ChangeOp,
    pub created_at: DateTime<Utc>,
    /// `None` iff `op == Create` (spec §3 invariant).
    pub original: Option<T>,
    pub retry_count: u32,
    pub last_error: Option<ErrorKind>,
    pub last_attempt: Option<Instant>,
}

impl<T: Entity> PendingChange<T> {
    /// `create` is always revertible (undo the optimistic insert);
    /// `update`/`delete` only when an `original` snapshot was captured
    /// (spec §4.5).
    pub fn is_revertible(&self) -> bool {
        match self.op {
            ChangeOp::Create => true,
            ChangeOp::Update | ChangeOp::Delete => self.original.is_some(),
        }
    }

    pub fn entity_id(&self) -> T::Id {
        self.item.id()
    }
}

/// Mutable fields `update()` is allowed to change (spec §4.5: "the only
/// mutation").
#[derive(Default)]
pub struct ChangeUpdate {
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<ErrorKind>>,
    pub last_attempt: Option<Option<Instant>>,
}

pub struct PendingQueue<T: Entity> {
    order: Vec<ChangeId>,
    by_id: HashMap<ChangeId, PendingChange<T>>,
    by_entity: HashMap<T::Id, Vec<ChangeId>>,
    tx: watch::Sender<Vec<PendingChange<T>>>,
}

impl<T: Entity> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> PendingQueue<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            order: Vec::new(),
            by_id: HashMap::new(),
            by_entity: HashMap::new(),
            tx,
        }
    }

    /// Seeded-subject stream of the full pending list, replaying the latest
    /// snapshot to new subscribers (spec §4.8 "seeded subject semantics",
    /// reused here for `pending_changes`).
    pub fn watch(&self) -> watch::Receiver<Vec<PendingChange<T>>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PendingChange<T>> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }

    /// Assigns a fresh `change_id`, appends in insertion order, and emits.
    pub fn add(&mut self, item: T, op: ChangeOp, original: Option<T>) -> ChangeId {
        debug_assert_eq!(op == ChangeOp::Create, original.is_none());
        let change_id = Uuid::new_v4();
        let entity_id = item.id();
        let change = PendingChange {
            change_id,
            item,
            op,
            created_at: Utc::now(),
            original,
            retry_count: 0,
            last_error: None,
            last_attempt: None,
        };
        self.order.push(change_id);
        self.by_id.insert(change_id, change);
        self.by_entity.entry(entity_id).or_default().push(change_id);
        self.emit();
        change_id
    }

    /// The only mutation allowed on an existing change (spec §4.5).
    pub fn update(&mut self, change_id: ChangeId, patch: ChangeUpdate) -> bool {
        let Some(change) = self.by_id.get_mut(&change_id) else {
            return false;
        };
        if let Some(retry_count) = patch.retry_count {
            // Monotonically non-decreasing (spec §3 invariant).
            change.retry_count = change.retry_count.max(retry_count);
        }
        if let Some(last_error) = patch.last_error {
            change.last_error = last_error;
        }
        if let Some(last_attempt) = patch.last_attempt {
            change.last_attempt = last_attempt;
        }
        self.emit();
        true
    }

    /// Removes a change outright — used by `commit` (success) and
    /// `fail-terminal` paths. Emits on removal.
    pub fn remove(&mut self, change_id: ChangeId) -> Option<PendingChange<T>> {
        let removed = self.remove_inner(change_id);
        if removed.is_some() {
            self.emit();
        }
        removed
    }

    /// Removes the change and returns its `original`, for the caller to
    /// revert cache state (the queue itself never touches the cache, spec
    /// §4.5).
    pub fn cancel(&mut self, change_id: ChangeId) -> Option<T> {
        let change = self.remove_inner(change_id)?;
        self.emit();
        change.original
    }

    /// Marks every change currently in a failed state for immediate retry
    /// by the sync driver — clearing `last_attempt` makes a caller-side
    /// backoff check treat it as due now. Performs no I/O itself (spec
    /// §4.5). Returns how many changes were affected.
    pub fn retry_all(&mut self) -> usize {
        let mut touched = 0;
        for change in self.by_id.values_mut() {
            if change.last_error.is_some() {
                change.last_attempt = None;
                touched += 1;
            }
        }
        if touched > 0 {
            self.emit();
        }
        touched
    }

    pub fn get(&self, change_id: ChangeId) -> Option<&PendingChange<T>> {
        self.by_id.get(&change_id)
    }

    pub fn by_entity(&self, id: &T::Id) -> Vec<PendingChange<T>> {
        self.by_entity
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|cid| self.by_id.get(cid))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn remove_inner(&mut self, change_id: ChangeId) -> Option<PendingChange<T>> {
        let change = self.by_id.remove(&change_id)?;
        self.order.retain(|id| *id != change_id);
        if let Some(bucket) = self.by_entity.get_mut(&change.entity_id()) {
            bucket.retain(|id| *id != change_id);
            if bucket.is_empty() {
                self.by_entity.remove(&change.entity_id());
            }
        }
        Some(change)
    }

    fn emit(&self) {
        let _ = self.tx.send(self.snapshot());
    }
}
