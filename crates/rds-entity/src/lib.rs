//! rds-entity
//!
//! The generic entity/identifier contract from spec §3: the core asks only
//! for a pure `id_of`, a bidirectional JSON-like mapping, and value-equality.
//! Grounded on `mqk-schemas` — a small, dependency-light crate of plain
//! `Serialize + Deserialize` structs shared by every other `mqk-*` crate —
//! generalized here into a trait instead of a fixed set of structs, since the
//! store core is generic over the caller's own entity types.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use rds_error::{StoreError, StoreResult};

/// The domain of primitives + nested maps + lists named in spec §3.
pub type FieldValue = Value;

/// `Map<String, Value>` — the wire/cache representation of an entity.
pub type ValueMap = Map<String, Value>;

/// The generic entity contract. Implementors are the caller's own domain
/// types; the core never constructs one except by round-tripping through
/// this trait.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    /// The identifier type. Must be cheap to clone and usable as a map key.
    type Id: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static;

    /// Pure projection from entity to identifier (spec §3 `id_of`).
    fn id(&self) -> Self::Id;

    /// Entity → `Map<String, Value>`.
    fn to_value_map(&self) -> ValueMap;

    /// `Map<String, Value>` → entity. Fails with `StoreError::Validation` if
    /// the map is missing required fields or holds the wrong shape.
    fn from_value_map(map: ValueMap) -> StoreResult<Self>
    where
        Self: Sized;

    /// Single-field projection used by the query evaluator and delta
    /// tracker. Default implementation round-trips through the full map;
    /// entities with expensive serialization may override this.
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.to_value_map().get(name).cloned()
    }
}

/// Helper for `Entity` impls backed by `#[derive(Serialize, Deserialize)]`
/// structs: `to_value_map`/`from_value_map` via `serde_json`, so an
/// implementor only has to supply `id()`.
pub fn to_value_map_via_serde<T: Serialize>(value: &T) -> StoreResult<ValueMap> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::validation(vec![rds_error::Violation::new(
            "<root>",
            format!("entity must serialize to a JSON object, got {other}"),
        )])),
        Err(e) => Err(StoreError::validation(vec![rds_error::Violation::new(
            "<root>",
            e.to_string(),
        )])),
    }
}

pub fn from_value_map_via_serde<T: DeserializeOwned>(map: ValueMap) -> StoreResult<T> {
    serde_json::from_value(Value::Object(map)).map_err(|e| {
        StoreError::validation(vec![rds_error::Violation::new("<root>", e.to_string())])
    })
}

/// Deep equality over the JSON value domain — used by the delta tracker
/// (spec §4.6) to decide whether a field actually changed.
pub fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: String,
        name: String,
        count: i64,
    }

    impl Entity for Widget {
        type Id = String;

        fn id(&self) -> Self::Id {
            self.id.clone()
        }

        fn to_value_map(&self) -> ValueMap {
            to_value_map_via_serde(self).expect("widget serializes")
        }

        fn from_value_map(map: ValueMap) -> StoreResult<Self> {
            from_value_map_via_serde(map)
        }
    }

    #[test]
    fn round_trips_through_value_map() {
        let w = Widget {
            id: "w1".into(),
            name: "Alice".into(),
            count: 3,
        };
        let map = w.to_value_map();
        let back = Widget::from_value_map(map).unwrap();
        assert_eq!(w, back);
    }

    #[test]
    fn field_projects_single_value() {
        let w = Widget {
            id: "w1".into(),
            name: "Alice".into(),
            count: 3,
        };
        assert_eq!(w.field("name"), Some(Value::String("Alice".into())));
        assert_eq!(w.field("missing"), None);
    }
}
