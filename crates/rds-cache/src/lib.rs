//! rds-cache
//!
//! In-memory cache with a tag→id reverse index and staleness marks (spec
//! §4.7, C7). The TTL-entry shape (`cached_at`/`stale_at` plus an
//! age-vs-threshold freshness check) is grounded on the pack's
//! venue-cache example (an instrument-metadata cache keyed by entry with
//! TTL-based staleness), generalized from one fixed instrument key to
//! arbitrary caller-supplied entity ids. The tag→id reverse index has no
//! precedent anywhere in the retrieval pack — this half is a novel
//! addition for the tag-scoped invalidation spec §4.7 requires.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rds_entity::Entity;
use rds_query::Query;

/// One cached item plus its tags and staleness marker (spec §3).
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub item: T,
    pub tags: HashSet<String>,
    pub cached_at: Instant,
    pub stale_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    pub fn is_stale(&self) -> bool {
        self.stale_at.is_some()
    }
}

/// Bidirectional tag ↔ id multi-mapping (spec §4.7). Every id it names
/// corresponds to a live `CacheEntry`; entry removal clears it from every
/// tag bucket in the same critical section — enforced here by `Cache`
/// owning both structures and only ever mutating them together.
#[derive(Default)]
struct TagIndex<Id> {
    by_tag: HashMap<String, HashSet<Id>>,
}

impl<Id: Clone + Eq + std::hash::Hash> TagIndex<Id> {
    fn add(&mut self, id: &Id, tags: &HashSet<String>) {
        for tag in tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id.clone());
        }
    }

    fn remove(&mut self, id: &Id, tags: &HashSet<String>) {
        for tag in tags {
            if let Some(bucket) = self.by_tag.get_mut(tag) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn ids_for_tags(&self, tags: &[String]) -> HashSet<Id> {
        let mut out = HashSet::new();
        for tag in tags {
            if let Some(bucket) = self.by_tag.get(tag) {
                out.extend(bucket.iter().cloned());
            }
        }
        out
    }
}

/// `ID → CacheEntry<T>` plus its tag index (spec §4.7). All mutating
/// operations are O(1) with respect to the number of entries touched.
pub struct Cache<T: Entity> {
    entries: HashMap<T::Id, CacheEntry<T>>,
    tags: TagIndex<T::Id>,
}

impl<T: Entity> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Cache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tags: TagIndex::default(),
        }
    }

    /// Inserts or replaces the entry for `id`, refreshing its tag
    /// membership and clearing any prior staleness mark.
    pub fn put(&mut self, id: T::Id, item: T, tags: HashSet<String>) {
        if let Some(old) = self.entries.get(&id) {
            self.tags.remove(&id, &old.tags);
        }
        self.tags.add(&id, &tags);
        self.entries.insert(
            id,
            CacheEntry {
                item,
                tags,
                cached_at: Instant::now(),
                stale_at: None,
            },
        );
    }

    pub fn get(&self, id: &T::Id) -> Option<&CacheEntry<T>> {
        self.entries.get(id)
    }

    /// Marks the given ids stale without deleting them, preserving
    /// stale-while-revalidate semantics (spec §4.7).
    pub fn invalidate(&mut self, ids: &[T::Id]) {
        let now = Instant::now();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.stale_at.get_or_insert(now);
            }
        }
    }

    /// Marks every entry carrying any of `tags` stale.
    pub fn invalidate_by_tags(&mut self, tags: &[String]) {
        let ids: Vec<T::Id> = self.tags.ids_for_tags(tags).into_iter().collect();
        self.invalidate(&ids);
    }

    /// Filters a snapshot of current entries through `query`, then marks
    /// the matches stale (spec §4.7).
    pub fn invalidate_where(&mut self, query: &Query) {
        let snapshot: Vec<T> = self.entries.values().map(|e| e.item.clone()).collect();
        let matches = query.evaluate(&snapshot);
        let ids: Vec<T::Id> = matches.iter().map(Entity::id).collect();
        self.invalidate(&ids);
    }

    pub fn add_tags(&mut self, id: &T::Id, new_tags: HashSet<String>) {
        if let Some(entry) = self.entries.get_mut(id) {
            self.tags.add(id, &new_tags);
            entry.tags.extend(new_tags);
        }
    }

    pub fn remove_tags(&mut self, id: &T::Id, drop_tags: &HashSet<String>) {
        if let Some(entry) = self.entries.get_mut(id) {
            self.tags.remove(id, drop_tags);
            for tag in drop_tags {
                entry.tags.remove(tag);
            }
        }
    }

    /// Deletes the entry outright (used when a backend confirms the item
    /// no longer exists), removing it from every tag bucket atomically.
    pub fn remove(&mut self, id: &T::Id) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(id)?;
        self.tags.remove(id, &entry.tags);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tag_count(&self, tag: &str) -> usize {
        self.tags.by_tag.get(tag).map_or(0, HashSet::len)
    }

    /// Flat snapshot of every live item, used by callers (e.g. the policy
    /// engine) that need to run a `Query` against the whole cache.
    pub fn items_snapshot(&self) -> Vec<T> {
        self.entries.values().map(|e| e.item.clone()).collect()
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
        name: String,
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

    fn tagset(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn put_then_get_returns_same_item_and_tags() {
        let mut cache = Cache::new();
        let u = User { id: "u1".into(), name: "A".into() };
        cache.put(u.id(), u.clone(), tagset(&["team-5"]));
        let entry = cache.get(&"u1".to_string()).unwrap();
        assert_eq!(entry.item, u);
        assert!(entry.tags.contains("team-5"));
        assert!(!entry.is_stale());
    }

    #[test]
    fn invalidate_by_tags_marks_stale_without_deleting() {
        let mut cache = Cache::new();
        for i in 0..3 {
            let u = User { id: format!("u{i}"), name: "A".into() };
            cache.put(u.id(), u, tagset(&["team-5"]));
        }
        cache.invalidate_by_tags(&["team-5".to_string()]);
        assert_eq!(cache.len(), 3);
        for i in 0..3 {
            assert!(cache.get(&format!("u{i}")).unwrap().is_stale());
        }
    }

    #[test]
    fn remove_clears_tag_index() {
        let mut cache = Cache::new();
        let u = User { id: "u1".into(), name: "A".into() };
        cache.put(u.id(), u, tagset(&["team-5"]));
        cache.remove(&"u1".to_string());
        assert_eq!(cache.tag_count("team-5"), 0);
    }

    #[test]
    fn invalidate_where_matches_query_over_snapshot() {
        let mut cache = Cache::new();
        cache.put("u1".into(), User { id: "u1".into(), name: "Alice".into() }, HashSet::new());
        cache.put("u2".into(), User { id: "u2".into(), name: "Bob".into() }, HashSet::new());

        let q = Query::new().r#where("name", Op::Eq, "Alice");
        cache.invalidate_where(&q);

        assert!(cache.get(&"u1".to_string()).unwrap().is_stale());
        assert!(!cache.get(&"u2".to_string()).unwrap().is_stale());
    }

    #[test]
    fn remove_tags_drops_membership_both_ways() {
        let mut cache = Cache::new();
        let u = User { id: "u1".into(), name: "A".into() };
        cache.put(u.id(), u, tagset(&["a", "b"]));
        cache.remove_tags(&"u1".to_string(), &tagset(&["a"]));
        assert_eq!(cache.tag_count("a"), 0);
        assert_eq!(cache.tag_count("b"), 1);
        assert!(!cache.get(&"u1".to_string()).unwrap().tags.contains("a"));
    }
}
