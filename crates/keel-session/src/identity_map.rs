//! Identity Map pattern: one in-memory instance per (entity type, identity).
//!
//! Entries hold the type-erased handle of a managed instance. Because the
//! handle is an `Arc`, every typed `EntityRef` recovered from the map points
//! at the same instance, and changes made through one are visible through
//! all of them.
//!
//! Entries remember the order they were registered in so that flush visits
//! them deterministically.

use keel_core::{AnyEntity, Entity, EntityRef, Value};
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

/// Unique key for an object in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Type identifier for the entity type.
    type_id: TypeId,
    /// Hash of the identity value.
    pk_hash: u64,
}

impl ObjectKey {
    pub fn new(type_id: TypeId, id: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        id.hash_key(&mut hasher);
        Self {
            type_id,
            pk_hash: hasher.finish(),
        }
    }

    pub fn of<E: Entity>(id: &Value) -> Self {
        Self::new(TypeId::of::<E>(), id)
    }

    /// Key for a type-erased instance, if it has an identity.
    pub fn of_entity(entity: &dyn AnyEntity) -> Option<Self> {
        entity.id().map(|id| Self::new(entity.entity_type(), &id))
    }

    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// Do two handles point at the same instance?
pub(crate) fn same_instance(a: &Arc<dyn AnyEntity>, b: &Arc<dyn AnyEntity>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct IdentityEntry {
    entity: Arc<dyn AnyEntity>,
    id: Value,
    order: u64,
}

/// Per-context cache of managed instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, IdentityEntry>,
    next_order: u64,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The managed instance for `(type_id, id)`.
    pub fn get(&self, type_id: TypeId, id: &Value) -> Option<Arc<dyn AnyEntity>> {
        self.entries
            .get(&ObjectKey::new(type_id, id))
            .filter(|entry| entry.id.same_key(id))
            .map(|entry| Arc::clone(&entry.entity))
    }

    /// Typed lookup.
    pub fn get_typed<E: Entity>(&self, id: &Value) -> Option<EntityRef<E>> {
        self.get(TypeId::of::<E>(), id)
            .and_then(EntityRef::from_erased)
    }

    pub fn contains(&self, type_id: TypeId, id: &Value) -> bool {
        self.get(type_id, id).is_some()
    }

    /// Register `entity` under `id`.
    ///
    /// If another instance is already registered for the key, it is kept and
    /// returned; the map never holds two instances of one row.
    pub fn put(&mut self, entity: Arc<dyn AnyEntity>, id: Value) -> Arc<dyn AnyEntity> {
        let key = ObjectKey::new(entity.entity_type(), &id);
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(&existing.entity);
        }
        let order = self.next_order;
        self.next_order += 1;
        tracing::trace!(
            entity = entity.entity_name(),
            pk_hash = key.pk_hash(),
            "registered in identity map"
        );
        self.entries.insert(
            key,
            IdentityEntry {
                entity: Arc::clone(&entity),
                id,
                order,
            },
        );
        entity
    }

    /// Remove the entry for `(type_id, id)`. Removing an absent key is a
    /// no-op.
    pub fn remove(&mut self, type_id: TypeId, id: &Value) -> Option<Arc<dyn AnyEntity>> {
        let key = ObjectKey::new(type_id, id);
        if !self.entries.get(&key).is_some_and(|e| e.id.same_key(id)) {
            return None;
        }
        self.entries.remove(&key).map(|e| e.entity)
    }

    /// Managed instances in registration order.
    pub fn entities(&self) -> Vec<(ObjectKey, Arc<dyn AnyEntity>)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.order);
        entries
            .into_iter()
            .map(|(key, entry)| (*key, Arc::clone(&entry.entity)))
            .collect()
    }

    /// Number of managed instances of type `type_id`.
    pub fn count_of(&self, type_id: TypeId) -> usize {
        self.entries.keys().filter(|k| k.type_id == type_id).count()
    }

    /// Remove every entry, returning the instances.
    pub fn drain(&mut self) -> Vec<Arc<dyn AnyEntity>> {
        let mut entries: Vec<_> = self.entries.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.order);
        entries.into_iter().map(|e| e.entity).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.entries.len())
            .finish()
    }
}
