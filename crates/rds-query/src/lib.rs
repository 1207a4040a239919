//! rds-query
//!
//! The declarative, backend-translatable query model from spec §4.1 (C1).
//! Immutable by construction — every builder method below returns a new
//! `Query`, never mutates `self` — and evaluable in-memory for the cache
//! fast path and for tests, while remaining opaque enough that a `Backend`
//! (spec §6) can translate it to its own native query language instead.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rds_entity::{Entity, FieldValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter operators named in spec §4.1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    IsNull,
    Contains,
    StartsWith,
    EndsWith,
    ArrayContains,
    ArrayContainsAny,
}

/// A single filter atom: `(field, op, operand)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterAtom {
    pub field: String,
    pub op: Op,
    pub operand: Value,
}

/// Sort direction for an `order_by` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// An `(field, direction)` sort key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub field: String,
    pub direction: Direction,
}

/// Immutable filter/order/limit tree. Construction never mutates; every
/// builder method returns a new instance (spec §4.1 invariant).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<FilterAtom>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub preload: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one more AND'd filter atom, returning a new `Query`.
    #[must_use]
    pub fn r#where(mut self, field: impl Into<String>, op: Op, operand: impl Into<Value>) -> Self {
        self.filters.push(FilterAtom {
            field: field.into(),
            op,
            operand: operand.into(),
        });
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderKey {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Tag fields to eagerly resolve (backend-dependent; the core passes
    /// this through unchanged, per spec §4.1).
    #[must_use]
    pub fn preload(mut self, tag_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.preload.extend(tag_fields.into_iter().map(Into::into));
        self
    }

    /// Stable hash of this query, used as a reactive-channel key (the
    /// "fingerprint" from the GLOSSARY).
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        hasher.finish()
    }

    /// In-memory evaluation used by the cache fast path and by tests:
    /// filters in order, then a stable sort by `order_by`, then `offset`
    /// then `limit` (spec §4.1).
    pub fn evaluate<T: Entity>(&self, items: &[T]) -> Vec<T> {
        let mut filtered: Vec<T> = items
            .iter()
            .filter(|item| self.matches(*item))
            .cloned()
            .collect();

        if !self.order_by.is_empty() {
            filtered.sort_by(|a, b| self.compare(a, b));
        }

        let start = self.offset.unwrap_or(0).min(filtered.len());
        let mut page: Vec<T> = filtered.split_off(start);
        if let Some(limit) = self.limit {
            page.truncate(limit);
        }
        page
    }

    pub fn matches<T: Entity>(&self, item: &T) -> bool {
        self.filters.iter().all(|atom| matches_atom(item, atom))
    }

    /// Lexicographic stable comparator over the `order_by` list: the first
    /// key is primary, subsequent keys break ties in order.
    fn compare<T: Entity>(&self, a: &T, b: &T) -> Ordering {
        for key in &self.order_by {
            let av = a.field(&key.field);
            let bv = b.field(&key.field);
            let ord = compare_values(av.as_ref(), bv.as_ref());
            let ord = match key.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn matches_atom<T: Entity>(item: &T, atom: &FilterAtom) -> bool {
    let field = item.field(&atom.field);
    match atom.op {
        Op::IsNull => field.is_none() || field == Some(Value::Null),
        Op::Eq => field.as_ref() == Some(&atom.operand),
        Op::Ne => field.as_ref() != Some(&atom.operand),
        Op::Lt => compare_values(field.as_ref(), Some(&atom.operand)) == Ordering::Less,
        Op::Le => compare_values(field.as_ref(), Some(&atom.operand)) != Ordering::Greater,
        Op::Gt => compare_values(field.as_ref(), Some(&atom.operand)) == Ordering::Greater,
        Op::Ge => compare_values(field.as_ref(), Some(&atom.operand)) != Ordering::Less,
        Op::In => match &atom.operand {
            Value::Array(values) => field.is_some_and(|f| values.contains(&f)),
            _ => false,
        },
        Op::NotIn => match &atom.operand {
            Value::Array(values) => match field {
                Some(f) => !values.contains(&f),
                None => true,
            },
            _ => true,
        },
        Op::Contains => match (field.as_ref(), &atom.operand) {
            (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
            _ => false,
        },
        Op::StartsWith => match (field.as_ref(), &atom.operand) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        Op::EndsWith => match (field.as_ref(), &atom.operand) {
            (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
            _ => false,
        },
        Op::ArrayContains => match field.as_ref() {
            Some(Value::Array(values)) => values.contains(&atom.operand),
            _ => false,
        },
        Op::ArrayContainsAny => match (field.as_ref(), &atom.operand) {
            (Some(Value::Array(values)), Value::Array(needles)) => {
                needles.iter().any(|n| values.contains(n))
            }
            _ => false,
        },
    }
}

/// Orders `FieldValue`s for sort/range comparisons. Numbers compare
/// numerically, strings lexicographically; `None`/non-comparable pairs sort
/// as equal rather than panicking — a missing field never breaks a sort.
fn compare_values(a: Option<&FieldValue>, b: Option<&FieldValue>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
