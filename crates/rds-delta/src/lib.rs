//! rds-delta
//!
//! Field-level diff and three-way merge (spec §4.6, C6). The per-field
//! comparison in `track()` is grounded on
//! `mqk-reconcile::engine::compare_orders` (pushes one
//! `ReconcileDiff::OrderMismatch{order_id, field, local, broker}` per
//! differing field between two order snapshots) — generalized from a
//! fixed order schema to arbitrary `serde_json::Value` maps via
//! `rds-entity`'s `ValueMap`. The merge/apply half has no teacher
//! precedent: `mqk-reconcile` only ever reports a mismatch and halts, it
//! never resolves one, so `merge()`'s strategies are this crate's own
//! addition.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rds_entity::{values_equal, FieldValue, ValueMap};

/// One field's before/after (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub name: String,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
    pub timestamp: DateTime<Utc>,
}

/// A set of field-level changes between two versions of one entity
/// (GLOSSARY: "Delta"). At most one `FieldChange` per field name; `old !=
/// new` holds for every entry (spec §3 invariant).
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaChange {
    pub entity_id: String,
    pub changes: Vec<FieldChange>,
    pub timestamp: DateTime<Utc>,
    pub base_version: Option<u64>,
}

impl DeltaChange {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn field_names(&self) -> BTreeSet<&str> {
        self.changes.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Builds a `DeltaChange` by comparing `original` to `modified`, field by
/// field, skipping any name in `exclude_fields` (spec §4.6).
pub fn track(
    original: &ValueMap,
    modified: &ValueMap,
    entity_id: impl Into<String>,
    base_version: Option<u64>,
    exclude_fields: &[&str],
    at: DateTime<Utc>,
) -> DeltaChange {
    let mut names: BTreeSet<&str> = BTreeSet::new();
    names.extend(original.keys().map(String::as_str));
    names.extend(modified.keys().map(String::as_str));

    let mut changes = Vec::new();
    for name in names {
        if exclude_fields.contains(&name) {
            continue;
        }
        let old = original.get(name).cloned();
        let new = modified.get(name).cloned();
        let differs = match (&old, &new) {
            (Some(a), Some(b)) => !values_equal(a, b),
            (None, None) => false,
            _ => true,
        };
        if differs {
            changes.push(FieldChange {
                name: name.to_string(),
                old,
                new,
                timestamp: at,
            });
        }
    }

    DeltaChange {
        entity_id: entity_id.into(),
        changes,
        timestamp: at,
        base_version,
    }
}

/// Applies every `change.new` onto `base` at `change.name`, removing the key
/// when `new` is `None`. Spec §4.6 round-trip invariant: `apply(a, track(a,
/// b)) == b` (for fields not excluded).
pub fn apply(base: &ValueMap, delta: &DeltaChange) -> ValueMap {
    let mut out = base.clone();
    for change in &delta.changes {
        match &change.new {
            Some(value) => {
                out.insert(change.name.clone(), value.clone());
            }
            None => {
                out.remove(&change.name);
            }
        }
    }
    out
}

/// A conflicting field's local and remote values, handed to a `Custom`
/// merge callback (spec §4.6 item 3).
pub struct FieldConflict<'a> {
    pub name: &'a str,
    pub local: Option<&'a FieldValue>,
    pub remote: Option<&'a FieldValue>,
}

/// Picks the winning value for one conflicting field. Returning `None`
/// falls back to `LastWriteWins` for that field (spec §4.6 item 3: "if the
/// callback is absent, fall back to LWW" — absence of a *result* for one
/// field gets the same treatment as absence of the callback itself).
pub type MergeCallback = dyn Fn(FieldConflict<'_>) -> Option<FieldValue> + Send + Sync;

/// How a conflicting field is resolved during a three-way merge (spec
/// §4.6). `Custom` carries its callback inline since a bare enum variant
/// can't hold a closure.
pub enum MergeStrategy<'a> {
    /// Picks one side's full set of conflicting values by comparing each
    /// field's own timestamp, ties favoring remote.
    LastWriteWins,
    /// Same per-field rule as `LastWriteWins`; kept distinct because the
    /// two strategies diverge once a caller wants per-field override hooks
    /// (`rds-policy` routes both through this engine today).
    FieldLevel,
    /// Calls a caller-supplied callback with `(field, local, remote)` for
    /// each conflicting field; falls back to `LastWriteWins` wherever the
    /// callback declines to pick (spec §4.6 item 3).
    Custom(&'a MergeCallback),
}

pub struct MergeOutcome {
    pub merged: ValueMap,
    pub conflicting_fields: Vec<String>,
}

/// Three-way merge of two deltas sharing a common `base` (spec §4.6).
///
/// 1. `conflicting_fields` = intersection of the two changed-field sets.
/// 2. Non-conflicting changes from both sides apply directly.
/// 3. Conflicting fields resolve per `strategy`.
pub fn merge(
    base: &ValueMap,
    local: &DeltaChange,
    remote: &DeltaChange,
    strategy: MergeStrategy<'_>,
) -> MergeOutcome {
    let local_names = local.field_names();
    let remote_names = remote.field_names();
    let conflicting: BTreeSet<&str> = local_names.intersection(&remote_names).copied().collect();

    let local_by_name: HashMap<&str, &FieldChange> =
        local.changes.iter().map(|c| (c.name.as_str(), c)).collect();
    let remote_by_name: HashMap<&str, &FieldChange> = remote
        .changes
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();

    let mut working = base.clone();

    for change in &local.changes {
        if !conflicting.contains(change.name.as_str()) {
            apply_one(&mut working, change);
        }
    }
    for change in &remote.changes {
        if !conflicting.contains(change.name.as_str()) {
            apply_one(&mut working, change);
        }
    }

    // `LastWriteWins` and `FieldLevel` resolve identically per field; the
    // distinction is which caller-facing policy selects them, not the
    // arithmetic here (spec §4.6). `Custom` defers to the callback first
    // and only falls back to the LWW rule below when it declines.
    let callback = match &strategy {
        MergeStrategy::Custom(cb) => Some(*cb),
        _ => None,
    };

    for name in &conflicting {
        let l = local_by_name.get(name).copied();
        let r = remote_by_name.get(name).copied();

        if let Some(cb) = callback {
            let conflict = FieldConflict {
                name,
                local: l.and_then(|c| c.new.as_ref()),
                remote: r.and_then(|c| c.new.as_ref()),
            };
            if let Some(value) = cb(conflict) {
                working.insert((*name).to_string(), value);
                continue;
            }
        }

        let winner = match (l, r) {
            (Some(l), Some(r)) => {
                if r.timestamp >= l.timestamp {
                    r
                } else {
                    l
                }
            }
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (None, None) => continue,
        };
        apply_one(&mut working, winner);
    }

    MergeOutcome {
        merged: working,
        conflicting_fields: conflicting.into_iter().map(str::to_string).collect(),
    }
}

fn apply_one(working: &mut ValueMap, change: &FieldChange) {
    match &change.new {
        Some(value) => {
            working.insert(change.name.clone(), value.clone());
        }
        None => {
            working.remove(&change.name);
        }
    }
}
