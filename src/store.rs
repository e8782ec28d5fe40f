// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local store: confirmed base rows plus an optimistic overlay.
//!
//! ```text
//!            get(key) / scan()
//!                   │
//!        ┌──────────▼──────────┐
//!        │  overlay (per key)  │  Upsert(row) | Tombstone   ← MutationCoordinator
//!        └──────────┬──────────┘
//!                   │ falls through when no entry
//!        ┌──────────▼──────────┐
//!        │     base rows       │  BTreeMap<Key, Row>         ← ingestion only
//!        └─────────────────────┘
//! ```
//!
//! The base is only written by the ingestion path, and every base write
//! happens together with the cursor advance for that batch. Client code
//! never touches the base directly. At most one overlay entry exists per
//! key, tagged with the mutation that installed it, so a late cleanup from
//! an older mutation can't clobber a newer one.
//!
//! The store itself is plain data. The owning collection wraps it in a lock
//! and forwards the [`ChangeSet`] returned by each transition to the live
//! query engine.

use crate::cursor::{Offset, ShapeCursor};
use crate::stream::{ChangeEvent, ChangeOp, Txid};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A row: a mapping of field names to JSON values.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Keys whose effective row may have changed in one transition.
pub type ChangeSet = BTreeSet<Key>;

/// Application-defined primary key of a row.
///
/// Numeric keys are stored in their decimal string form and compare as
/// strings, so `scan()` puts `"10"` before `"9"`. Order a query by a numeric
/// field when numeric order matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Create a key.
    pub fn new(key: impl Into<String>) -> Self {
        Key(key.into())
    }

    /// Borrow the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract a key from a JSON value (strings and integers only).
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Key(s.clone())),
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(Key(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key(v.to_string())
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Self {
        Key(v.to_string())
    }
}

/// Identifier of an optimistic mutation, unique within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Optimistic value installed for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayValue {
    /// The row as the pending mutation wants it.
    Upsert(Row),
    /// Pending delete. Reads see the key as absent.
    Tombstone,
}

/// Overlay entry, tagged with the mutation that owns it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OverlayEntry {
    pub mutation_id: MutationId,
    pub value: OverlayValue,
}

/// Shallow-merge `patch` into `target`, field by field.
pub fn merge_row(target: &mut Row, patch: &Row) {
    for (field, value) in patch {
        target.insert(field.clone(), value.clone());
    }
}

/// Apply one change to a base map. Returns `true` if the map changed.
///
/// Updates merge into the existing row; an update for an unknown key is
/// treated as an insert.
pub fn apply_change(base: &mut BTreeMap<Key, Row>, op: ChangeOp, key: &Key, value: Option<&Row>) -> bool {
    match op {
        ChangeOp::Insert => {
            let row = value.cloned().unwrap_or_default();
            match base.get(key) {
                Some(existing) if *existing == row => false,
                _ => {
                    base.insert(key.clone(), row);
                    true
                }
            }
        }
        ChangeOp::Update => {
            let patch = value.cloned().unwrap_or_default();
            match base.get_mut(key) {
                Some(existing) => {
                    let before = existing.clone();
                    merge_row(existing, &patch);
                    *existing != before
                }
                None => {
                    base.insert(key.clone(), patch);
                    true
                }
            }
        }
        ChangeOp::Delete => base.remove(key).is_some(),
    }
}

/// Outcome of applying one batch to the base.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppliedBatch {
    /// Keys whose base row changed.
    pub changed: ChangeSet,
    /// Changes applied.
    pub applied: usize,
    /// Changes skipped as redeliveries (offset at or behind the cursor).
    pub skipped: usize,
    /// Transaction ids carried by the applied changes.
    pub txids: Vec<Txid>,
}

/// In-memory materialized view of one collection.
#[derive(Debug, Default)]
pub struct LocalStore {
    base: BTreeMap<Key, Row>,
    overlay: HashMap<Key, OverlayEntry>,
    cursor: ShapeCursor,
}

impl LocalStore {
    /// Create an empty store with a snapshot cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective row for a key.
    pub fn get(&self, key: &Key) -> Option<&Row> {
        match self.overlay.get(key) {
            Some(OverlayEntry { value: OverlayValue::Upsert(row), .. }) => Some(row),
            Some(OverlayEntry { value: OverlayValue::Tombstone, .. }) => None,
            None => self.base.get(key),
        }
    }

    /// Check if a key has an effective row.
    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Confirmed row for a key, ignoring the overlay.
    pub fn base_get(&self, key: &Key) -> Option<&Row> {
        self.base.get(key)
    }

    /// All effective rows in key order.
    pub fn scan(&self) -> impl Iterator<Item = (&Key, &Row)> {
        let mut keys: BTreeSet<&Key> = self.base.keys().collect();
        keys.extend(self.overlay.keys());
        keys.into_iter().filter_map(move |k| self.get(k).map(|row| (k, row)))
    }

    /// Number of effective rows.
    pub fn len(&self) -> usize {
        let base_visible = self
            .base
            .keys()
            .filter(|k| !matches!(self.overlay.get(*k), Some(OverlayEntry { value: OverlayValue::Tombstone, .. })))
            .count();
        let overlay_only = self
            .overlay
            .iter()
            .filter(|(k, e)| matches!(e.value, OverlayValue::Upsert(_)) && !self.base.contains_key(*k))
            .count();
        base_visible + overlay_only
    }

    /// Check if there are no effective rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of confirmed rows.
    pub fn base_len(&self) -> usize {
        self.base.len()
    }

    /// Current replication cursor.
    pub fn cursor(&self) -> &ShapeCursor {
        &self.cursor
    }

    /// Apply a single change to the base. Returns `true` if the base changed.
    ///
    /// Does not move the cursor; use [`apply_changes`](Self::apply_changes)
    /// for stream batches.
    pub fn apply_base(&mut self, event: &ChangeEvent) -> bool {
        apply_change(&mut self.base, event.op, &event.key, event.value.as_ref())
    }

    /// Apply a batch of changes and advance the cursor, as one step.
    ///
    /// Changes at or behind the cursor offset the batch started from are
    /// skipped as redeliveries. `resolve_key` maps a change to the key it is
    /// stored under.
    pub fn apply_changes<'a, I, F>(
        &mut self,
        changes: I,
        handle: Option<&str>,
        batch_offset: Offset,
        resolve_key: F,
    ) -> AppliedBatch
    where
        I: IntoIterator<Item = &'a ChangeEvent>,
        F: Fn(&ChangeEvent) -> Key,
    {
        let start = self.cursor.offset;
        let mut result = AppliedBatch::default();
        let mut high = batch_offset;

        for change in changes {
            if !start.is_initial() && change.offset <= start {
                result.skipped += 1;
                continue;
            }
            let key = resolve_key(change);
            if apply_change(&mut self.base, change.op, &key, change.value.as_ref()) {
                result.changed.insert(key);
            }
            result.applied += 1;
            result.txids.extend(change.txids.iter().copied());
            if change.offset > high {
                high = change.offset;
            }
        }

        self.cursor.advance(handle, high);
        result
    }

    /// Replace the whole base with a fresh snapshot and cursor.
    ///
    /// Returns the keys whose base row differs between old and new.
    pub fn replace_base(&mut self, base: BTreeMap<Key, Row>, cursor: ShapeCursor) -> ChangeSet {
        let mut changed = ChangeSet::new();
        for (k, row) in &self.base {
            if base.get(k) != Some(row) {
                changed.insert(k.clone());
            }
        }
        for k in base.keys() {
            if !self.base.contains_key(k) {
                changed.insert(k.clone());
            }
        }
        self.base = base;
        self.cursor = cursor;
        changed
    }

    /// Take the base rows and cursor, discarding the overlay.
    pub fn into_parts(self) -> (BTreeMap<Key, Row>, ShapeCursor) {
        (self.base, self.cursor)
    }

    /// Number of keys with an overlay entry.
    pub fn overlay_len(&self) -> usize {
        self.overlay.len()
    }

    /// Install an optimistic value for a key, replacing any previous entry.
    pub fn set_overlay(&mut self, key: Key, mutation_id: MutationId, value: OverlayValue) {
        self.overlay.insert(key, OverlayEntry { mutation_id, value });
    }

    /// Remove the overlay for a key if it is owned by `mutation_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn clear_overlay(&mut self, key: &Key, mutation_id: MutationId) -> bool {
        match self.overlay.get(key) {
            Some(entry) if entry.mutation_id == mutation_id => {
                self.overlay.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_key_conversions() {
        assert_eq!(Key::from("a").as_str(), "a");
        assert_eq!(Key::from(42i64).as_str(), "42");
        assert_eq!(Key::from(7u64), Key::new("7"));
        assert_eq!(Key::from_value(&json!("x")), Some(Key::new("x")));
        assert_eq!(Key::from_value(&json!(12)), Some(Key::new("12")));
        assert_eq!(Key::from_value(&json!(1.5)), None);
        assert_eq!(Key::from_value(&json!(null)), None);
    }

    #[test]
    fn test_numeric_keys_scan_as_strings() {
        let mut store = LocalStore::new();
        for (i, n) in [9i64, 10, 2].into_iter().enumerate() {
            store.apply_base(&ChangeEvent::insert(Offset::new(1, i as u64), n, row(json!({"n": n}))));
        }
        let keys: Vec<&str> = store.scan().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["10", "2", "9"]);
    }

    #[test]
    fn test_apply_insert_update_delete() {
        let mut store = LocalStore::new();
        let k = Key::from("todo-1");

        assert!(store.apply_base(&ChangeEvent::insert(Offset::new(1, 0), "todo-1", row(json!({"title": "milk", "completed": false})))));
        assert_eq!(store.get(&k).unwrap()["title"], json!("milk"));

        assert!(store.apply_base(&ChangeEvent::update(Offset::new(2, 0), "todo-1", row(json!({"completed": true})))));
        let r = store.get(&k).unwrap();
        assert_eq!(r["title"], json!("milk"));
        assert_eq!(r["completed"], json!(true));

        // Same update again changes nothing
        assert!(!store.apply_base(&ChangeEvent::update(Offset::new(3, 0), "todo-1", row(json!({"completed": true})))));

        assert!(store.apply_base(&ChangeEvent::delete(Offset::new(4, 0), "todo-1")));
        assert!(store.get(&k).is_none());
        assert!(!store.apply_base(&ChangeEvent::delete(Offset::new(5, 0), "todo-1")));
    }

    #[test]
    fn test_update_unknown_key_inserts() {
        let mut base = BTreeMap::new();
        assert!(apply_change(&mut base, ChangeOp::Update, &Key::from("a"), Some(&row(json!({"x": 1})))));
        assert_eq!(base[&Key::from("a")]["x"], json!(1));
    }

    #[test]
    fn test_overlay_shadows_base() {
        let mut store = LocalStore::new();
        let k = Key::from("a");
        store.apply_base(&ChangeEvent::insert(Offset::new(1, 0), "a", row(json!({"v": 1}))));

        store.set_overlay(k.clone(), MutationId(1), OverlayValue::Upsert(row(json!({"v": 2}))));
        assert_eq!(store.get(&k).unwrap()["v"], json!(2));
        assert_eq!(store.base_get(&k).unwrap()["v"], json!(1));

        store.set_overlay(k.clone(), MutationId(2), OverlayValue::Tombstone);
        assert!(store.get(&k).is_none());
        assert!(!store.contains(&k));
        assert_eq!(store.len(), 0);

        // Wrong owner can't clear
        assert!(!store.clear_overlay(&k, MutationId(1)));
        assert!(store.clear_overlay(&k, MutationId(2)));
        assert_eq!(store.get(&k).unwrap()["v"], json!(1));
    }

    #[test]
    fn test_scan_merges_layers_in_key_order() {
        let mut store = LocalStore::new();
        store.apply_base(&ChangeEvent::insert(Offset::new(1, 0), "b", row(json!({"n": "b"}))));
        store.apply_base(&ChangeEvent::insert(Offset::new(1, 1), "d", row(json!({"n": "d"}))));
        store.set_overlay(Key::from("a"), MutationId(1), OverlayValue::Upsert(row(json!({"n": "a"}))));
        store.set_overlay(Key::from("d"), MutationId(2), OverlayValue::Tombstone);
        store.set_overlay(Key::from("c"), MutationId(3), OverlayValue::Tombstone);

        let keys: Vec<&str> = store.scan().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.base_len(), 2);
        assert_eq!(store.overlay_len(), 3);
    }

    #[test]
    fn test_apply_changes_advances_cursor_and_skips_redelivery() {
        let mut store = LocalStore::new();
        let batch = vec![
            ChangeEvent::insert(Offset::new(1, 0), "a", row(json!({"v": 1}))).with_txid(10u64),
            ChangeEvent::insert(Offset::new(1, 0), "b", row(json!({"v": 2}))),
        ];
        let applied = store.apply_changes(&batch, Some("h"), Offset::new(1, 0), |c| c.key.clone());
        assert_eq!(applied.applied, 2);
        assert_eq!(applied.skipped, 0);
        assert_eq!(applied.txids, vec![Txid(10)]);
        assert_eq!(store.cursor().offset, Offset::new(1, 0));
        assert_eq!(store.cursor().handle.as_deref(), Some("h"));

        // Redelivery of the same batch is a no-op
        let again = store.apply_changes(&batch, Some("h"), Offset::new(1, 0), |c| c.key.clone());
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped, 2);
        assert!(again.changed.is_empty());

        // Partially overlapping batch applies only the new part
        let next = vec![
            ChangeEvent::update(Offset::new(1, 0), "a", row(json!({"v": 99}))),
            ChangeEvent::update(Offset::new(2, 0), "a", row(json!({"v": 3}))),
        ];
        let applied = store.apply_changes(&next, None, Offset::new(2, 0), |c| c.key.clone());
        assert_eq!(applied.applied, 1);
        assert_eq!(applied.skipped, 1);
        assert_eq!(store.get(&Key::from("a")).unwrap()["v"], json!(3));
        assert_eq!(store.cursor().offset, Offset::new(2, 0));
    }

    #[test]
    fn test_replace_base_reports_diff() {
        let mut store = LocalStore::new();
        store.apply_base(&ChangeEvent::insert(Offset::new(1, 0), "a", row(json!({"v": 1}))));
        store.apply_base(&ChangeEvent::insert(Offset::new(1, 0), "b", row(json!({"v": 2}))));

        let mut fresh = BTreeMap::new();
        fresh.insert(Key::from("b"), row(json!({"v": 2})));
        fresh.insert(Key::from("c"), row(json!({"v": 3})));
        let mut cursor = ShapeCursor::start();
        cursor.advance(Some("h2"), Offset::new(9, 0));

        let changed = store.replace_base(fresh, cursor);
        let changed: Vec<&str> = changed.iter().map(Key::as_str).collect();
        assert_eq!(changed, vec!["a", "c"]);
        assert_eq!(store.cursor().handle.as_deref(), Some("h2"));
    }

    #[test]
    fn test_merge_row() {
        let mut target = row(json!({"a": 1, "b": 2}));
        merge_row(&mut target, &row(json!({"b": 3, "c": 4})));
        assert_eq!(serde_json::Value::Object(target), json!({"a": 1, "b": 3, "c": 4}));
    }
}
