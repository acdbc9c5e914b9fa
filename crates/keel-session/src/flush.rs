//! Pending write actions and the flush that executes them.
//!
//! Actions are numbered when they are enqueued. Flush runs them in three
//! phases, each in sequence order:
//!
//! 1. INSERT every saved entity, using the payload captured at save time
//! 2. UPDATE every managed entity that differs from its snapshot
//! 3. DELETE every removed entity
//!
//! Running inserts first means updates can write foreign keys that point at
//! identities generated in phase 1.

use crate::change_tracker::ChangeTracker;
use crate::identity_map::{IdentityMap, ObjectKey, same_instance};
use keel_core::{
    AnyEntity, Auditing, EntityState, Error, IdGeneration, InvalidOperationKind, Result, Store,
    Value,
};
use keel_query::TableInfo;
use keel_query::crud;
use serde::Serialize;
use std::sync::Arc;

/// Kind of write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
}

/// One queued write.
#[derive(Clone)]
pub struct PendingAction {
    pub seq: u64,
    pub kind: ActionKind,
    pub entity: Arc<dyn AnyEntity>,
    /// Column values captured at enqueue time (INSERT only).
    pub payload: Vec<(&'static str, Value)>,
}

impl std::fmt::Debug for PendingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAction")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .field("entity", &self.entity.entity_name())
            .field("id", &self.entity.id())
            .finish_non_exhaustive()
    }
}

/// Write actions waiting for the next flush.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<PendingAction>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn enqueue(
        &mut self,
        kind: ActionKind,
        entity: Arc<dyn AnyEntity>,
        payload: Vec<(&'static str, Value)>,
    ) -> u64 {
        let seq = self.next_seq();
        tracing::trace!(
            seq,
            kind = ?kind,
            entity = entity.entity_name(),
            "enqueued write action"
        );
        self.actions.push(PendingAction {
            seq,
            kind,
            entity,
            payload,
        });
        seq
    }

    /// Drop every queued action for `entity`, returning how many were
    /// dropped.
    pub fn cancel(&mut self, entity: &Arc<dyn AnyEntity>) -> usize {
        let before = self.actions.len();
        self.actions.retain(|a| !same_instance(&a.entity, entity));
        before - self.actions.len()
    }

    /// Is there a queued action of `kind` for `entity`?
    pub fn has(&self, kind: ActionKind, entity: &Arc<dyn AnyEntity>) -> bool {
        self.actions
            .iter()
            .any(|a| a.kind == kind && same_instance(&a.entity, entity))
    }

    /// Remove and return the actions of `kind`, in sequence order.
    pub fn take(&mut self, kind: ActionKind) -> Vec<PendingAction> {
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.actions)
            .into_iter()
            .partition(|a| a.kind == kind);
        self.actions = rest;
        let mut taken = taken;
        taken.sort_by_key(|a| a.seq);
        taken
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    pub fn drain(&mut self) -> Vec<PendingAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One executed write, as reported by flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub seq: u64,
    pub kind: ActionKind,
    pub entity: &'static str,
    pub table: &'static str,
    /// Identity of the row written, rendered for display.
    pub id: String,
}

/// Summary of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub actions: Vec<ActionRecord>,
}

impl FlushReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Executed actions of `kind`.
    pub fn of_kind(&self, kind: ActionKind) -> impl Iterator<Item = &ActionRecord> {
        self.actions.iter().filter(move |a| a.kind == kind)
    }

    fn record(&mut self, seq: u64, kind: ActionKind, entity: &dyn AnyEntity) {
        match kind {
            ActionKind::Insert => self.inserted += 1,
            ActionKind::Update => self.updated += 1,
            ActionKind::Delete => self.deleted += 1,
        }
        self.actions.push(ActionRecord {
            seq,
            kind,
            entity: entity.entity_name(),
            table: entity.table(),
            id: entity
                .id()
                .map_or_else(|| "NULL".to_string(), |id| id.to_string()),
        });
    }
}

/// Borrowed state of one persistence context, for the duration of a flush.
pub(crate) struct Flush<'a, S: Store> {
    pub store: &'a S,
    pub identity: &'a mut IdentityMap,
    pub tracker: &'a mut ChangeTracker,
    pub queue: &'a mut ActionQueue,
    pub auditing: &'a Auditing,
    pub context_id: u64,
}

impl<S: Store> Flush<'_, S> {
    /// Execute all pending work. Stops at the first failing statement.
    pub fn run(self) -> Result<FlushReport> {
        let mut report = FlushReport::new();
        tracing::info!(
            inserts = self.queue.count(ActionKind::Insert),
            deletes = self.queue.count(ActionKind::Delete),
            managed = self.identity.len(),
            "flush started"
        );

        let dialect = self.store.dialect();

        for action in self.queue.take(ActionKind::Insert) {
            let entity = &action.entity;
            let table = TableInfo::of_erased(entity.as_ref());
            let stmt = crud::insert(dialect, &table, &action.payload);
            tracing::debug!(seq = action.seq, table = table.name, sql = %stmt.sql, "INSERT");

            let id = match table.id_generation {
                IdGeneration::Generated => {
                    let generated = Value::BigInt(self.store.insert(&stmt.sql, &stmt.params)?);
                    entity.assign_id(generated.clone());
                    generated
                }
                IdGeneration::Assigned => {
                    self.store.execute(&stmt.sql, &stmt.params)?;
                    entity.id().ok_or_else(|| {
                        Error::invalid(
                            InvalidOperationKind::MissingIdentity,
                            format!("{} was saved without an identity", entity.entity_name()),
                        )
                    })?
                }
            };

            entity.set_state(EntityState::Managed, Some(self.context_id));
            self.identity.put(Arc::clone(entity), id.clone());

            let mut snapshot = action.payload;
            if let Some(slot) = snapshot.iter_mut().find(|(name, _)| *name == table.primary_key) {
                slot.1 = id.clone();
            }
            self.tracker
                .snapshot(ObjectKey::new(entity.entity_type(), &id), snapshot);
            report.record(action.seq, ActionKind::Insert, entity.as_ref());
        }

        for (key, entity) in self.identity.entities() {
            if entity.state() != EntityState::Managed {
                continue;
            }
            let current = entity.to_row();
            if !self.tracker.is_dirty(&key, entity.columns(), &current) {
                continue;
            }
            let Some(id) = entity.id() else { continue };

            entity.stamp_update(self.auditing);
            let row = entity.to_row();
            let seq = self.queue.next_seq();
            let table = TableInfo::of_erased(entity.as_ref());
            if let Some(stmt) = crud::update(dialect, &table, &row, &id) {
                tracing::debug!(seq, table = table.name, sql = %stmt.sql, "UPDATE");
                self.store.execute(&stmt.sql, &stmt.params)?;
                report.record(seq, ActionKind::Update, entity.as_ref());
            }
            self.tracker.snapshot(key, row);
        }

        for action in self.queue.take(ActionKind::Delete) {
            let entity = &action.entity;
            let Some(id) = entity.id() else { continue };
            let table = TableInfo::of_erased(entity.as_ref());
            let stmt = crud::delete(dialect, &table, &id);
            tracing::debug!(seq = action.seq, table = table.name, sql = %stmt.sql, "DELETE");
            self.store.execute(&stmt.sql, &stmt.params)?;

            self.identity.remove(entity.entity_type(), &id);
            self.tracker
                .clear(&ObjectKey::new(entity.entity_type(), &id));
            entity.set_state(EntityState::Removed, None);
            report.record(action.seq, ActionKind::Delete, entity.as_ref());
        }

        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            "flush complete"
        );
        Ok(report)
    }
}
