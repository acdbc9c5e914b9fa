//! Shared handles to in-memory entity instances.
//!
//! The persistence context hands out `EntityRef<E>` instead of owned values
//! so that two loads of one row observe a single instance. Reference
//! identity is `EntityRef::ptr_eq`.

use crate::Result;
use crate::audit::Auditing;
use crate::entity::{ColumnDef, Entity, IdGeneration};
use crate::error::{Error, InvalidOperationKind};
use crate::value::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Created by the caller, unknown to any context.
    Transient,
    /// Saved; its INSERT is queued but not yet flushed.
    Pending,
    /// Present in a context's identity map and tracked for changes.
    Managed,
    /// Deleted in a context; its DELETE is queued.
    Deleted,
    /// Deleted and flushed, or its pending INSERT was cancelled.
    Removed,
    /// Evicted from the context, or the context ended.
    Detached,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Transient => "transient",
            EntityState::Pending => "pending",
            EntityState::Managed => "managed",
            EntityState::Deleted => "deleted",
            EntityState::Removed => "removed",
            EntityState::Detached => "detached",
        }
    }

    /// Does a context still own the instance?
    pub const fn is_attached(self) -> bool {
        matches!(
            self,
            EntityState::Pending | EntityState::Managed | EntityState::Deleted
        )
    }

    const fn is_deleted(self) -> bool {
        matches!(self, EntityState::Deleted | EntityState::Removed)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: EntityState,
    context: Option<u64>,
}

struct EntityCell<E> {
    value: RwLock<E>,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: Entity> EntityCell<E> {
    fn new(value: E, state: EntityState, context: Option<u64>) -> Self {
        Self {
            value: RwLock::new(value),
            lifecycle: Mutex::new(Lifecycle { state, context }),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, E> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.value.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A shared handle to one in-memory entity instance.
pub struct EntityRef<E: Entity> {
    cell: Arc<EntityCell<E>>,
}

impl<E: Entity> EntityRef<E> {
    /// Wrap a new, transient instance.
    pub fn new(value: E) -> Self {
        Self {
            cell: Arc::new(EntityCell::new(value, EntityState::Transient, None)),
        }
    }

    /// Wrap an instance that a context is about to manage.
    ///
    /// Used by the persistence context when materializing rows.
    pub fn attached(value: E, state: EntityState, context: u64) -> Self {
        Self {
            cell: Arc::new(EntityCell::new(value, state, Some(context))),
        }
    }

    /// Borrow the current state. Reading is allowed in every lifecycle state.
    pub fn read(&self) -> EntityReadGuard<'_, E> {
        EntityReadGuard(self.cell.read())
    }

    /// Borrow the instance mutably.
    ///
    /// Fails with `MutateAfterDelete` once the entity has been deleted.
    pub fn write(&self) -> Result<EntityWriteGuard<'_, E>> {
        let state = self.state();
        if state.is_deleted() {
            return Err(Error::invalid(
                InvalidOperationKind::MutateAfterDelete,
                format!(
                    "{} {} was deleted and can no longer be modified",
                    E::NAME,
                    self.describe_id()
                ),
            ));
        }
        Ok(EntityWriteGuard(self.cell.write()))
    }

    /// Apply a mutation through `write`.
    pub fn modify<R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R> {
        let mut guard = self.write()?;
        Ok(f(&mut guard))
    }

    /// Mutate without the lifecycle check.
    ///
    /// Used by the persistence context for identity assignment and refresh.
    pub fn write_unchecked(&self) -> EntityWriteGuard<'_, E> {
        EntityWriteGuard(self.cell.write())
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn state(&self) -> EntityState {
        self.cell.lifecycle().state
    }

    /// Id of the context that owns this instance, if any.
    pub fn context_id(&self) -> Option<u64> {
        self.cell.lifecycle().context
    }

    /// Move to a new lifecycle state.
    ///
    /// Used by the persistence context.
    pub fn set_state(&self, state: EntityState, context: Option<u64>) {
        let mut lifecycle = self
            .cell
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.state = state;
        lifecycle.context = context;
    }

    /// The identity, if one has been assigned.
    pub fn id(&self) -> Option<Value> {
        self.cell.read().id()
    }

    /// Type-erased view used by the identity map and change tracker.
    pub fn erased(&self) -> Arc<dyn AnyEntity> {
        self.cell.clone()
    }

    /// Recover a typed handle from a type-erased one.
    pub fn from_erased(erased: Arc<dyn AnyEntity>) -> Option<Self> {
        erased
            .into_any()
            .downcast::<EntityCell<E>>()
            .ok()
            .map(|cell| Self { cell })
    }

    fn describe_id(&self) -> String {
        self.id().map_or_else(|| "(no id)".to_string(), |id| id.to_string())
    }
}

impl<E: Entity> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<E: Entity + fmt::Debug> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("state", &self.state())
            .field("value", &*self.read())
            .finish()
    }
}

pub struct EntityReadGuard<'a, E>(RwLockReadGuard<'a, E>);

impl<E> Deref for EntityReadGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

pub struct EntityWriteGuard<'a, E>(RwLockWriteGuard<'a, E>);

impl<E> Deref for EntityWriteGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

impl<E> DerefMut for EntityWriteGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.0
    }
}

/// Type-erased operations the persistence context needs on every managed
/// instance, whatever its entity type.
pub trait AnyEntity: Send + Sync {
    fn entity_type(&self) -> TypeId;
    fn entity_name(&self) -> &'static str;
    fn table(&self) -> &'static str;
    fn primary_key(&self) -> &'static str;
    fn columns(&self) -> &'static [ColumnDef];
    fn id_generation(&self) -> IdGeneration;
    fn id(&self) -> Option<Value>;
    fn assign_id(&self, id: Value);
    fn to_row(&self) -> Vec<(&'static str, Value)>;
    fn state(&self) -> EntityState;
    fn context_id(&self) -> Option<u64>;
    fn set_state(&self, state: EntityState, context: Option<u64>);
    /// Stamp audit fields for an INSERT. Returns false if the entity has none.
    fn stamp_insert(&self, auditing: &Auditing) -> bool;
    /// Stamp audit fields for an UPDATE. Returns false if the entity has none.
    fn stamp_update(&self, auditing: &Auditing) -> bool;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> AnyEntity for EntityCell<E> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn entity_name(&self) -> &'static str {
        E::NAME
    }

    fn table(&self) -> &'static str {
        E::TABLE
    }

    fn primary_key(&self) -> &'static str {
        E::PRIMARY_KEY
    }

    fn columns(&self) -> &'static [ColumnDef] {
        E::columns()
    }

    fn id_generation(&self) -> IdGeneration {
        E::ID_GENERATION
    }

    fn id(&self) -> Option<Value> {
        self.read().id()
    }

    fn assign_id(&self, id: Value) {
        self.write().set_id(id);
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        self.read().to_row()
    }

    fn state(&self) -> EntityState {
        self.lifecycle().state
    }

    fn context_id(&self) -> Option<u64> {
        self.lifecycle().context
    }

    fn set_state(&self, state: EntityState, context: Option<u64>) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.state = state;
        lifecycle.context = context;
    }

    fn stamp_insert(&self, auditing: &Auditing) -> bool {
        let mut value = self.write();
        match value.audit_mut() {
            Some(audit) => {
                audit.on_insert(auditing);
                true
            }
            None => false,
        }
    }

    fn stamp_update(&self, auditing: &Auditing) -> bool {
        let mut value = self.write();
        match value.audit_mut() {
            Some(audit) => {
                audit.on_update(auditing);
                true
            }
            None => false,
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
