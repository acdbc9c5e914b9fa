//! Change tracking and dirty detection.
//!
//! A snapshot of an entity's column values is taken when it becomes
//! managed and after every successful write. Flush compares the current
//! values of the updatable columns against it.
//!
//! This keeps two copies of every tracked entity's state in memory: the
//! live instance and its snapshot. Read-only loads skip the snapshot and
//! are never dirty-checked.

use crate::identity_map::ObjectKey;
use keel_core::{ColumnDef, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Column values of an entity at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: Vec<(&'static str, Value)>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: Vec<(&'static str, Value)>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Snapshots of tracked entities, by identity-map key.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `values` as the clean state of `key`.
    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn snapshot(&mut self, key: ObjectKey, values: Vec<(&'static str, Value)>) {
        tracing::trace!(
            pk_hash = key.pk_hash(),
            columns = values.len(),
            "taking object snapshot"
        );
        self.snapshots.insert(key, ObjectSnapshot::new(values));
    }

    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn get_snapshot(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    /// Updatable columns whose current value differs from the snapshot.
    ///
    /// Returns `None` for untracked keys: without a snapshot there is
    /// nothing to compare against.
    pub fn changed_columns(
        &self,
        key: &ObjectKey,
        columns: &[ColumnDef],
        current: &[(&'static str, Value)],
    ) -> Option<Vec<&'static str>> {
        let snapshot = self.snapshots.get(key)?;
        let changed: Vec<&'static str> = current
            .iter()
            .filter(|(name, _)| columns.iter().any(|c| c.name == *name && c.updatable))
            .filter(|(name, value)| !snapshot.get(name).is_some_and(|old| old.same_key(value)))
            .map(|(name, _)| *name)
            .collect();
        tracing::trace!(
            pk_hash = key.pk_hash(),
            dirty = !changed.is_empty(),
            fields = ?changed,
            "dirty check result"
        );
        Some(changed)
    }

    /// Has the entity changed since its snapshot? Untracked keys are clean.
    pub fn is_dirty(
        &self,
        key: &ObjectKey,
        columns: &[ColumnDef],
        current: &[(&'static str, Value)],
    ) -> bool {
        self.changed_columns(key, columns, current)
            .is_some_and(|changed| !changed.is_empty())
    }

    /// Forget the snapshot for `key`.
    pub fn clear(&mut self, key: &ObjectKey) {
        self.snapshots.remove(key);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[ColumnDef] = &[
        ColumnDef::generated_id("member_id"),
        ColumnDef::new("username"),
        ColumnDef::new("age"),
        ColumnDef::insert_only("created_by"),
    ];

    fn key() -> ObjectKey {
        ObjectKey::new(std::any::TypeId::of::<u8>(), &Value::BigInt(1))
    }

    fn row(age: i32, created_by: &str) -> Vec<(&'static str, Value)> {
        vec![
            ("member_id", Value::BigInt(1)),
            ("username", Value::Text("member1".into())),
            ("age", Value::Int(age)),
            ("created_by", Value::Text(created_by.into())),
        ]
    }

    #[test]
    fn untouched_entity_is_clean() {
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(key(), row(10, "admin"));
        assert!(!tracker.is_dirty(&key(), COLUMNS, &row(10, "admin")));
        assert_eq!(
            tracker.changed_columns(&key(), COLUMNS, &row(10, "admin")),
            Some(vec![])
        );
    }

    #[test]
    fn changed_updatable_column_is_reported() {
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(key(), row(10, "admin"));
        assert_eq!(
            tracker.changed_columns(&key(), COLUMNS, &row(11, "admin")),
            Some(vec!["age"])
        );
    }

    #[test]
    fn insert_only_columns_are_ignored() {
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(key(), row(10, "admin"));
        assert!(!tracker.is_dirty(&key(), COLUMNS, &row(10, "someone-else")));
    }

    #[test]
    fn integer_widths_compare_equal() {
        let mut tracker = ChangeTracker::new();
        let mut snap = row(10, "admin");
        snap[2].1 = Value::BigInt(10);
        tracker.snapshot(key(), snap);
        assert!(!tracker.is_dirty(&key(), COLUMNS, &row(10, "admin")));
    }

    #[test]
    fn untracked_key_has_no_changes() {
        let tracker = ChangeTracker::new();
        assert_eq!(tracker.changed_columns(&key(), COLUMNS, &row(1, "x")), None);
        assert!(!tracker.is_dirty(&key(), COLUMNS, &row(1, "x")));
    }
}
