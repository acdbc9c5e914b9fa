//! Associations between entities and their lazy proxies.
//!
//! An association is either already loaded or an explicit proxy that has
//! to be resolved against the context that produced it. Nothing here
//! performs I/O behind a field access: `get` never queries, `resolve` may.
//!
//! # Resolution states
//!
//! ```text
//! UNRESOLVED --resolve--> RESOLVING --ok--> RESOLVED
//!      ^                      |
//!      +--------error---------+
//! ```
//!
//! Callers racing on the same proxy wait for the resolution in flight
//! instead of issuing their own query.

use crate::Result;
use crate::entity::Entity;
use crate::error::{Error, InvalidOperationKind, StaleReferenceError, ValidationErrorKind};
use crate::managed::{AnyEntity, EntityRef, EntityState};
use crate::row::Row;
use crate::value::Value;
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

/// Identifies one persistence context and whether it is still open.
///
/// Every proxy carries the token of the context that created it.
#[derive(Debug, Clone)]
pub struct ContextToken {
    id: u64,
    open: Arc<AtomicBool>,
}

impl ContextToken {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the context as ended. Irreversible.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// How a proxy finds its target rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyKey {
    /// Primary key of the target, read from the owner's foreign key column.
    ForeignKey(Value),
    /// Target rows whose `column` equals the owner's identity.
    MappedBy { column: &'static str, value: Value },
}

/// Everything a proxy knows about the association it stands in for.
#[derive(Debug, Clone)]
pub struct ProxyOrigin {
    pub owner: &'static str,
    pub owner_id: Option<Value>,
    pub association: &'static str,
    pub target_table: &'static str,
    pub key: ProxyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Unresolved,
    Resolving,
    Resolved,
}

/// Loads association targets for proxies. Implemented by the persistence
/// context.
pub trait AssociationLoader {
    /// Token of the context doing the loading.
    fn context_token(&self) -> &ContextToken;

    /// Load one entity by identity, through the identity map.
    fn load_reference<E: Entity>(&mut self, id: &Value) -> Result<Option<EntityRef<E>>>;

    /// Load every entity whose `column` equals `value`.
    fn load_collection<E: Entity>(
        &mut self,
        column: &'static str,
        value: &Value,
    ) -> Result<Vec<EntityRef<E>>>;
}

/// A value a proxy can be resolved into.
pub trait Resolvable: Sized + Send + Sync {
    fn load<L: AssociationLoader>(loader: &mut L, origin: &ProxyOrigin) -> Result<Self>;
}

impl<E: Entity> Resolvable for Option<EntityRef<E>> {
    fn load<L: AssociationLoader>(loader: &mut L, origin: &ProxyOrigin) -> Result<Self> {
        match &origin.key {
            ProxyKey::ForeignKey(id) => match loader.load_reference::<E>(id)? {
                Some(target) => Ok(Some(target)),
                // The foreign key was read from a live row, so the target
                // existed at load time.
                None => Err(Error::StaleReference(StaleReferenceError {
                    owner: origin.owner,
                    association: origin.association,
                    target_table: origin.target_table,
                    key: id.to_string(),
                })),
            },
            ProxyKey::MappedBy { column, value } => {
                Ok(loader.load_collection::<E>(column, value)?.into_iter().next())
            }
        }
    }
}

impl<E: Entity> Resolvable for Vec<EntityRef<E>> {
    fn load<L: AssociationLoader>(loader: &mut L, origin: &ProxyOrigin) -> Result<Self> {
        match &origin.key {
            ProxyKey::MappedBy { column, value } => loader.load_collection::<E>(column, value),
            ProxyKey::ForeignKey(_) => {
                Ok(Option::<EntityRef<E>>::load(loader, origin)?.into_iter().collect())
            }
        }
    }
}

struct ProxyInner<T> {
    origin: ProxyOrigin,
    token: Option<ContextToken>,
    state: Mutex<ProxyState>,
    ready: Condvar,
    value: OnceLock<T>,
}

impl<T> ProxyInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deferred-resolution stand-in for an association value.
///
/// Clones share resolution state, so resolving any clone resolves all.
pub struct LazyProxy<T> {
    inner: Arc<ProxyInner<T>>,
}

impl<T: Resolvable> LazyProxy<T> {
    pub fn new(origin: ProxyOrigin, token: Option<ContextToken>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                origin,
                token,
                state: Mutex::new(ProxyState::Unresolved),
                ready: Condvar::new(),
                value: OnceLock::new(),
            }),
        }
    }

    pub fn origin(&self) -> &ProxyOrigin {
        &self.inner.origin
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.lock_state()
    }

    /// The resolved value, without I/O.
    pub fn get(&self) -> Option<&T> {
        self.inner.value.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Resolve through `loader`, at most once.
    ///
    /// A resolved proxy returns its cached value. Otherwise the owning
    /// context must still be open and must be the one `loader` belongs to.
    /// A failed resolution leaves the proxy unresolved so it can be retried.
    #[tracing::instrument(level = "debug", skip_all, fields(owner = self.inner.origin.owner, association = self.inner.origin.association))]
    pub fn resolve<L: AssociationLoader>(&self, loader: &mut L) -> Result<&T> {
        if let Some(value) = self.inner.value.get() {
            return Ok(value);
        }
        self.check_context(loader.context_token())?;

        let mut state = self.inner.lock_state();
        loop {
            if let Some(value) = self.inner.value.get() {
                return Ok(value);
            }
            if *state == ProxyState::Resolving {
                state = self
                    .inner
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            } else {
                break;
            }
        }
        *state = ProxyState::Resolving;
        drop(state);

        let outcome = T::load(loader, &self.inner.origin);

        let mut state = self.inner.lock_state();
        match outcome {
            Ok(value) => {
                let _ = self.inner.value.set(value);
                *state = ProxyState::Resolved;
                self.inner.ready.notify_all();
                drop(state);
                tracing::debug!("lazy association resolved");
                self.inner
                    .value
                    .get()
                    .ok_or_else(|| Error::Custom("resolved proxy lost its value".to_string()))
            }
            Err(e) => {
                *state = ProxyState::Unresolved;
                self.inner.ready.notify_all();
                tracing::debug!(error = %e, "lazy association resolution failed");
                Err(e)
            }
        }
    }

    fn check_context(&self, loader_token: &ContextToken) -> Result<()> {
        let origin = &self.inner.origin;
        let token = match &self.inner.token {
            Some(token) if token.is_open() => token,
            _ => {
                return Err(Error::invalid(
                    InvalidOperationKind::ContextClosed,
                    format!(
                        "cannot resolve {}.{}: the context that loaded it has ended",
                        origin.owner, origin.association
                    ),
                ));
            }
        };
        if token.id() != loader_token.id() {
            return Err(Error::invalid(
                InvalidOperationKind::ForeignContext,
                format!(
                    "{}.{} was loaded by context {} and cannot be resolved by context {}",
                    origin.owner,
                    origin.association,
                    token.id(),
                    loader_token.id()
                ),
            ));
        }
        Ok(())
    }
}

impl<T> Clone for LazyProxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for LazyProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProxy")
            .field("owner", &self.inner.origin.owner)
            .field("association", &self.inner.origin.association)
            .field("key", &self.inner.origin.key)
            .field("state", &*self.inner.lock_state())
            .finish()
    }
}

/// An association value: loaded, or a proxy awaiting resolution.
#[derive(Debug)]
pub enum Association<T> {
    Loaded(T),
    Unresolved(LazyProxy<T>),
}

/// A single-valued association.
pub type ToOne<E> = Association<Option<EntityRef<E>>>;

/// A collection-valued association.
pub type ToMany<E> = Association<Vec<EntityRef<E>>>;

impl<T: Resolvable> Association<T> {
    /// The value if loaded or already resolved. Never performs I/O.
    pub fn get(&self) -> Option<&T> {
        match self {
            Association::Loaded(value) => Some(value),
            Association::Unresolved(proxy) => proxy.get(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    /// The value, resolving the proxy through `loader` if needed.
    pub fn resolve<L: AssociationLoader>(&self, loader: &mut L) -> Result<&T> {
        match self {
            Association::Loaded(value) => Ok(value),
            Association::Unresolved(proxy) => proxy.resolve(loader),
        }
    }

    pub fn proxy(&self) -> Option<&LazyProxy<T>> {
        match self {
            Association::Loaded(_) => None,
            Association::Unresolved(proxy) => Some(proxy),
        }
    }
}

impl<E: Entity> Association<Option<EntityRef<E>>> {
    /// Point at `target`.
    pub fn to(target: &EntityRef<E>) -> Self {
        Association::Loaded(Some(target.clone()))
    }

    pub fn none() -> Self {
        Association::Loaded(None)
    }

    /// Value for the owner's foreign key column.
    ///
    /// An unflushed target has no identity yet and yields NULL; the flush
    /// writes the key once the target's INSERT has run.
    pub fn foreign_key(&self) -> Value {
        match self {
            Association::Loaded(target) => target
                .as_ref()
                .and_then(EntityRef::id)
                .unwrap_or(Value::Null),
            Association::Unresolved(proxy) => match proxy.get() {
                Some(target) => target
                    .as_ref()
                    .and_then(EntityRef::id)
                    .unwrap_or(Value::Null),
                None => match &proxy.origin().key {
                    ProxyKey::ForeignKey(id) => id.clone(),
                    ProxyKey::MappedBy { .. } => Value::Null,
                },
            },
        }
    }
}

impl<T: Default> Default for Association<T> {
    fn default() -> Self {
        Association::Loaded(T::default())
    }
}

impl<T: Clone> Clone for Association<T> {
    fn clone(&self) -> Self {
        match self {
            Association::Loaded(value) => Association::Loaded(value.clone()),
            Association::Unresolved(proxy) => Association::Unresolved(proxy.clone()),
        }
    }
}

/// Type-erased access to a context's identity map, used while rows are
/// turned into entities.
pub trait EntityCache {
    /// The managed instance for `(entity_type, id)`, if any.
    fn lookup(&self, entity_type: TypeId, id: &Value) -> Option<Arc<dyn AnyEntity>>;

    /// Register a freshly materialized instance. `snapshot` is `None` for
    /// read-only loads, which are never dirty-checked.
    fn adopt(
        &mut self,
        entity: Arc<dyn AnyEntity>,
        id: Value,
        snapshot: Option<Vec<(&'static str, Value)>>,
    );
}

/// State threaded through `Entity::from_row`.
///
/// Materializing through a `LoadContext` applies identity-map deduplication:
/// a row whose identity is already managed yields the managed instance and
/// the freshly decoded copy is discarded.
pub struct LoadContext<'a> {
    cache: Option<&'a mut dyn EntityCache>,
    token: Option<ContextToken>,
    fetched: Vec<&'static str>,
    read_only: bool,
}

impl<'a> LoadContext<'a> {
    /// Load into the context owning `cache`.
    pub fn new(cache: &'a mut dyn EntityCache, token: ContextToken) -> Self {
        Self {
            cache: Some(cache),
            token: Some(token),
            fetched: Vec::new(),
            read_only: false,
        }
    }

    /// Load outside any context. Entities come back detached and their
    /// proxies can never be resolved.
    pub fn detached() -> Self {
        Self {
            cache: None,
            token: None,
            fetched: Vec::new(),
            read_only: false,
        }
    }

    /// Associations whose target columns were fetched with the row under
    /// the `{association}__` prefix.
    #[must_use]
    pub fn fetching(mut self, associations: &[&'static str]) -> Self {
        self.fetched = associations.to_vec();
        self
    }

    /// Skip snapshots for newly materialized entities.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Turn a row into a managed instance, reusing the managed one if the
    /// identity is already known.
    pub fn materialize<T: Entity>(&mut self, row: &Row) -> Result<EntityRef<T>> {
        let id = row
            .get_by_name(T::PRIMARY_KEY)
            .filter(|v| !v.is_null())
            .cloned();

        if let (Some(cache), Some(id)) = (self.cache.as_deref(), id.as_ref()) {
            if let Some(existing) = cache
                .lookup(TypeId::of::<T>(), id)
                .and_then(EntityRef::<T>::from_erased)
            {
                tracing::trace!(entity = T::NAME, id = %id, "identity map hit, discarding decoded row");
                return Ok(existing);
            }
        }

        let value = T::from_row(row, self)?;
        match (self.cache.as_deref_mut(), &self.token, id) {
            (Some(cache), Some(token), Some(id)) => {
                let entity = EntityRef::attached(value, EntityState::Managed, token.id());
                let snapshot = (!self.read_only).then(|| entity.read().to_row());
                cache.adopt(entity.erased(), id, snapshot);
                Ok(entity)
            }
            _ => {
                let entity = EntityRef::new(value);
                entity.set_state(EntityState::Detached, None);
                Ok(entity)
            }
        }
    }

    /// Build the single-valued association `name` of `O` from `row`.
    pub fn to_one<O: Entity, T: Entity>(
        &mut self,
        name: &'static str,
        row: &Row,
    ) -> Result<ToOne<T>> {
        let info = O::association(name).ok_or_else(|| unknown_association::<O>(name))?;

        if self.fetched.contains(&name) {
            let joined = row.subset_by_prefix(name);
            if joined
                .get_by_name(T::PRIMARY_KEY)
                .is_none_or(Value::is_null)
            {
                return Ok(Association::Loaded(None));
            }
            // Fetch hints apply to the root entity only.
            let fetched = std::mem::take(&mut self.fetched);
            let target = self.materialize::<T>(&joined);
            self.fetched = fetched;
            return Ok(Association::Loaded(Some(target?)));
        }

        let fk = row
            .get_by_name(info.join_column)
            .cloned()
            .unwrap_or(Value::Null);
        if fk.is_null() {
            return Ok(Association::Loaded(None));
        }
        let origin = ProxyOrigin {
            owner: O::NAME,
            owner_id: row.get_by_name(O::PRIMARY_KEY).cloned(),
            association: info.name,
            target_table: info.target_table,
            key: ProxyKey::ForeignKey(fk),
        };
        Ok(Association::Unresolved(LazyProxy::new(
            origin,
            self.token.clone(),
        )))
    }

    /// Build the collection-valued association `name` of `O` from `row`.
    pub fn to_many<O: Entity, T: Entity>(
        &mut self,
        name: &'static str,
        row: &Row,
    ) -> Result<ToMany<T>> {
        let info = O::association(name).ok_or_else(|| unknown_association::<O>(name))?;
        let owner_id = row
            .get_by_name(O::PRIMARY_KEY)
            .cloned()
            .unwrap_or(Value::Null);
        if owner_id.is_null() {
            return Ok(Association::Loaded(Vec::new()));
        }
        let origin = ProxyOrigin {
            owner: O::NAME,
            owner_id: Some(owner_id.clone()),
            association: info.name,
            target_table: info.target_table,
            key: ProxyKey::MappedBy {
                column: info.join_column,
                value: owner_id,
            },
        };
        Ok(Association::Unresolved(LazyProxy::new(
            origin,
            self.token.clone(),
        )))
    }
}

fn unknown_association<O: Entity>(name: &str) -> Error {
    Error::validation(
        name,
        ValidationErrorKind::UnknownProperty,
        format!("no association '{name}' found for type '{}'", O::NAME),
    )
}
