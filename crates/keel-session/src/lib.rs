//! Persistence context for keel.
//!
//! `keel-session` is the **unit-of-work layer**. A [`Session`] owns one
//! store transaction and the working set of entities loaded or saved in it:
//!
//! - **Identity map**: one in-memory instance per (entity type, identity),
//!   including for rows materialized by queries.
//! - **Change tracking**: snapshots taken on load are compared at flush, so
//!   callers mutate entities directly without marking them dirty.
//! - **Write queue**: saves and deletes are numbered and executed at flush,
//!   inserts first, then updates, then deletes.
//! - **Lazy associations**: proxies produced by this session resolve through
//!   it, and fail once it has ended.
//! - **Paging and bulk statements**: page/slice queries materialize through
//!   the identity map; bulk statements bypass it.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::begin(store)?;
//!
//! let member = session.persist(Member::new("member1", 10))?;
//! session.flush()?;
//!
//! let found = session.find::<Member>(member.id().unwrap())?.unwrap();
//! assert!(EntityRef::ptr_eq(&member, &found));
//!
//! found.modify(|m| m.age = 11)?;
//! let store = session.commit()?; // flushes one UPDATE, then commits
//! ```
//!
//! # Staleness after bulk statements
//!
//! [`Session::bulk_update`] and [`Session::bulk_delete`] run directly
//! against the store. Managed entities whose rows they touch are **not**
//! refreshed and keep showing their old values until re-read. Pass
//! [`BulkOptions::clearing`] (or set [`SessionConfig::clear_on_bulk`]) to
//! detach everything after the statement so later reads fetch fresh rows.
//!
//! # Threading
//!
//! A session is confined to one unit of work and is not meant to be shared
//! between threads. Entity handles and proxies are `Send + Sync`, but only
//! the session that produced a proxy can resolve it.

pub mod change_tracker;
pub mod flush;
pub mod identity_map;

#[cfg(test)]
pub(crate) mod testing;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use flush::{ActionKind, ActionQueue, ActionRecord, FlushReport, PendingAction};
pub use identity_map::{IdentityMap, ObjectKey};

use flush::Flush;
use identity_map::same_instance;
use keel_core::{
    AnyEntity, Association, AssociationLoader, Auditing, ContextToken, Dialect, Entity,
    EntityCache, EntityRef, EntityState, Error, FromValue, IdGeneration, InvalidOperationKind,
    LoadContext, Resolvable, Result, Row, Statement, Store, Value,
};
use keel_query::{
    BulkDelete, BulkUpdate, LockMode, Page, PageRequest, Query, Slice, TableInfo, col, crud,
    total_without_count,
};
use std::any::TypeId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Detach every managed entity after a bulk statement.
    pub clear_on_bulk: bool,
    /// Flush pending changes before a bulk statement runs.
    pub flush_before_bulk: bool,
    /// Flush pending changes in `commit`.
    pub flush_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clear_on_bulk: false,
            flush_before_bulk: true,
            flush_on_commit: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clear_on_bulk(mut self, value: bool) -> Self {
        self.clear_on_bulk = value;
        self
    }

    #[must_use]
    pub fn flush_before_bulk(mut self, value: bool) -> Self {
        self.flush_before_bulk = value;
        self
    }

    #[must_use]
    pub fn flush_on_commit(mut self, value: bool) -> Self {
        self.flush_on_commit = value;
        self
    }
}

/// How a unit of work ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

/// Options for one bulk statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Detach every managed entity once the statement succeeds.
    pub clear: bool,
}

impl BulkOptions {
    /// Clear the context after the statement.
    pub fn clearing() -> Self {
        Self { clear: true }
    }
}

/// Whether a page query also counts the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountPolicy {
    /// Report the exact total. The count statement is skipped when a short
    /// page already implies it.
    #[default]
    Exact,
    /// Leave the total unknown.
    Skip,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    /// A flush failed; only rollback is allowed.
    Failed,
    Closed,
}

// ============================================================================
// Session
// ============================================================================

/// Identity map and snapshots, split from the session so rows can be
/// materialized while the store is borrowed.
#[derive(Debug, Default)]
struct Tracked {
    identity: IdentityMap,
    tracker: ChangeTracker,
}

impl EntityCache for Tracked {
    fn lookup(&self, entity_type: TypeId, id: &Value) -> Option<Arc<dyn AnyEntity>> {
        self.identity.get(entity_type, id)
    }

    fn adopt(
        &mut self,
        entity: Arc<dyn AnyEntity>,
        id: Value,
        snapshot: Option<Vec<(&'static str, Value)>>,
    ) {
        let key = ObjectKey::new(entity.entity_type(), &id);
        self.identity.put(entity, id);
        if let Some(values) = snapshot {
            self.tracker.snapshot(key, values);
        }
    }
}

/// The persistence context of one unit of work.
pub struct Session<S: Store> {
    /// `None` once the unit of work has ended.
    store: Option<S>,
    token: ContextToken,
    tracked: Tracked,
    queue: ActionQueue,
    config: SessionConfig,
    auditing: Auditing,
    status: SessionStatus,
}

impl<S: Store> Session<S> {
    /// Start a unit of work on `store` with default configuration and no
    /// auditor.
    pub fn begin(store: S) -> Result<Self> {
        Self::begin_with(store, SessionConfig::default(), Auditing::default())
    }

    /// Start a unit of work with explicit configuration and auditing
    /// capabilities.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn begin_with(store: S, config: SessionConfig, auditing: Auditing) -> Result<Self> {
        store.begin()?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, dialect = store.dialect().name(), "unit of work started");
        Ok(Self {
            store: Some(store),
            token: ContextToken::new(id),
            tracked: Tracked::default(),
            queue: ActionQueue::new(),
            config,
            auditing,
            status: SessionStatus::Open,
        })
    }

    /// Identifier of this context.
    pub fn id(&self) -> u64 {
        self.token.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> Result<&S> {
        self.store.as_ref().ok_or_else(|| {
            Error::invalid(InvalidOperationKind::ContextClosed, "the session has ended")
        })
    }

    fn dialect(&self) -> Result<Dialect> {
        Ok(self.store()?.dialect())
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.status {
            SessionStatus::Open => Ok(()),
            SessionStatus::Failed => Err(Error::invalid(
                InvalidOperationKind::ContextFailed,
                "a previous flush failed; roll back this session",
            )),
            SessionStatus::Closed => Err(Error::invalid(
                InvalidOperationKind::ContextClosed,
                "the session has ended",
            )),
        }
    }

    fn owns(&self, entity: &dyn AnyEntity) -> bool {
        entity.context_id() == Some(self.token.id())
    }

    // ========================================================================
    // Entity lifecycle
    // ========================================================================

    /// Make a transient entity managed; its INSERT runs at the next flush.
    ///
    /// Saving an entity this session already manages is a no-op. Audit
    /// fields are stamped here and the payload is captured now.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn save<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.ensure_usable()?;
        let erased = entity.erased();
        let owned = self.owns(erased.as_ref());
        match entity.state() {
            EntityState::Transient => self.enqueue_insert(entity, erased),
            EntityState::Managed | EntityState::Pending if owned => Ok(()),
            EntityState::Deleted if owned => Err(Error::invalid(
                InvalidOperationKind::MutateAfterDelete,
                format!("{} was deleted in this session and cannot be saved", E::NAME),
            )),
            EntityState::Managed | EntityState::Pending | EntityState::Deleted => {
                Err(Error::invalid(
                    InvalidOperationKind::ForeignContext,
                    format!("{} is managed by another session", E::NAME),
                ))
            }
            EntityState::Removed => Err(Error::invalid(
                InvalidOperationKind::MutateAfterDelete,
                format!("{} has been deleted", E::NAME),
            )),
            EntityState::Detached => Err(Error::invalid(
                InvalidOperationKind::NotManaged,
                format!("{} is detached; load it again with find", E::NAME),
            )),
        }
    }

    fn enqueue_insert<E: Entity>(
        &mut self,
        entity: &EntityRef<E>,
        erased: Arc<dyn AnyEntity>,
    ) -> Result<()> {
        if E::ID_GENERATION == IdGeneration::Assigned {
            let id = entity.id().ok_or_else(|| {
                Error::invalid(
                    InvalidOperationKind::MissingIdentity,
                    format!("{} uses assigned identities but has none", E::NAME),
                )
            })?;
            if let Some(existing) = self.tracked.identity.get(TypeId::of::<E>(), &id) {
                if !same_instance(&existing, &erased) {
                    return Err(Error::invalid(
                        InvalidOperationKind::DuplicateIdentity,
                        format!("another {} with identity {id} is already managed", E::NAME),
                    ));
                }
            }
            self.tracked.identity.put(Arc::clone(&erased), id);
        }

        erased.stamp_insert(&self.auditing);
        entity.set_state(EntityState::Pending, Some(self.token.id()));
        let payload = erased.to_row();
        let seq = self.queue.enqueue(flush::ActionKind::Insert, erased, payload);
        tracing::debug!(entity = E::NAME, seq, "entity saved");
        Ok(())
    }

    /// Wrap `value` in a handle and save it.
    pub fn persist<E: Entity>(&mut self, value: E) -> Result<EntityRef<E>> {
        let entity = EntityRef::new(value);
        self.save(&entity)?;
        Ok(entity)
    }

    /// Look up an entity by identity.
    ///
    /// A managed instance is returned without touching the store. A missing
    /// row is `Ok(None)`, never an error.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn find<E: Entity>(&mut self, id: impl Into<Value>) -> Result<Option<EntityRef<E>>> {
        self.find_with(id.into(), LockMode::None)
    }

    /// Look up an entity by identity and lock its row for writing.
    ///
    /// The row is always read from the store so the lock is taken, even when
    /// the instance is already managed.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn find_for_update<E: Entity>(
        &mut self,
        id: impl Into<Value>,
    ) -> Result<Option<EntityRef<E>>> {
        self.find_with(id.into(), LockMode::PessimisticWrite)
    }

    fn find_with<E: Entity>(&mut self, id: Value, lock: LockMode) -> Result<Option<EntityRef<E>>> {
        self.ensure_usable()?;
        if lock == LockMode::None {
            if let Some(existing) = self.tracked.identity.get_typed::<E>(&id) {
                tracing::trace!(entity = E::NAME, id = %id, "identity map hit");
                return Ok(visible(existing));
            }
        }

        let stmt = crud::select_by_id(self.dialect()?, &TableInfo::of::<E>(), &id, lock);
        let rows = self.run_query(&stmt)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let entity =
            LoadContext::new(&mut self.tracked, self.token.clone()).materialize::<E>(row)?;
        Ok(visible(entity))
    }

    /// Every row of `E`.
    pub fn find_all<E: Entity>(&mut self) -> Result<Vec<EntityRef<E>>> {
        self.list(&Query::new())
    }

    /// Stage a managed entity for deletion.
    ///
    /// Deleting an entity saved in this session but not yet flushed cancels
    /// its INSERT instead. Further mutation of a deleted entity fails.
    /// Deleting an already deleted entity is a no-op.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn delete<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.ensure_usable()?;
        let erased = entity.erased();
        if !self.owns(erased.as_ref()) {
            return Err(Error::invalid(
                InvalidOperationKind::NotManaged,
                format!(
                    "{} ({}) is not managed by this session",
                    E::NAME,
                    entity.state()
                ),
            ));
        }
        match entity.state() {
            EntityState::Pending => {
                self.queue.cancel(&erased);
                if let Some(id) = entity.id() {
                    self.forget(&erased, &id);
                }
                entity.set_state(EntityState::Removed, None);
                tracing::debug!(entity = E::NAME, "pending insert cancelled");
            }
            EntityState::Managed => {
                entity.set_state(EntityState::Deleted, Some(self.token.id()));
                let seq = self
                    .queue
                    .enqueue(flush::ActionKind::Delete, erased, Vec::new());
                tracing::debug!(entity = E::NAME, seq, "entity deleted");
            }
            EntityState::Deleted => {
                tracing::trace!(entity = E::NAME, "entity already deleted");
            }
            _ => {}
        }
        Ok(())
    }

    /// Is `entity` managed (or pending insert) in this session?
    pub fn contains<E: Entity>(&self, entity: &EntityRef<E>) -> bool {
        entity.context_id() == Some(self.token.id())
            && matches!(entity.state(), EntityState::Managed | EntityState::Pending)
    }

    /// Stop managing `entity`. Its queued writes are discarded.
    pub fn detach<E: Entity>(&mut self, entity: &EntityRef<E>) {
        let erased = entity.erased();
        if !self.owns(erased.as_ref()) {
            return;
        }
        self.queue.cancel(&erased);
        if let Some(id) = entity.id() {
            self.forget(&erased, &id);
        }
        entity.set_state(EntityState::Detached, None);
    }

    /// Remove `erased` from the identity map and change tracker, if it is
    /// the instance registered under `id`.
    fn forget(&mut self, erased: &Arc<dyn AnyEntity>, id: &Value) {
        let registered = self
            .tracked
            .identity
            .get(erased.entity_type(), id)
            .is_some_and(|e| same_instance(&e, erased));
        if registered {
            self.tracked.identity.remove(erased.entity_type(), id);
            self.tracked
                .tracker
                .clear(&ObjectKey::new(erased.entity_type(), id));
        }
    }

    /// Detach every entity and discard all queued writes.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.token.id()))]
    pub fn clear(&mut self) {
        let context = Some(self.token.id());
        let mut detached = 0usize;
        let queued = self.queue.drain().into_iter().map(|a| a.entity);
        for entity in self.tracked.identity.drain().into_iter().chain(queued) {
            if entity.context_id() == context {
                entity.set_state(EntityState::Detached, None);
                detached += 1;
            }
        }
        self.tracked.tracker.clear_all();
        tracing::debug!(detached, "context cleared");
    }

    /// Overwrite a managed entity with its current row.
    ///
    /// Returns `false` (and detaches the entity) if the row no longer exists.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn refresh<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<bool> {
        self.ensure_usable()?;
        if !self.owns(entity.erased().as_ref()) || entity.state() != EntityState::Managed {
            return Err(Error::invalid(
                InvalidOperationKind::NotManaged,
                format!("only managed {} instances can be refreshed", E::NAME),
            ));
        }
        let id = entity.id().ok_or_else(|| {
            Error::invalid(
                InvalidOperationKind::MissingIdentity,
                format!("{} has no identity to refresh", E::NAME),
            )
        })?;

        let stmt = crud::select_by_id(self.dialect()?, &TableInfo::of::<E>(), &id, LockMode::None);
        let rows = self.run_query(&stmt)?;
        let Some(row) = rows.first() else {
            self.detach(entity);
            return Ok(false);
        };
        let fresh = {
            let mut cx = LoadContext::new(&mut self.tracked, self.token.clone());
            E::from_row(row, &mut cx)?
        };
        *entity.write_unchecked() = fresh;
        let values = entity.read().to_row();
        self.tracked.tracker.snapshot(ObjectKey::of::<E>(&id), values);
        Ok(true)
    }

    /// Has `entity` changed since it was loaded or last flushed?
    pub fn is_dirty<E: Entity>(&self, entity: &EntityRef<E>) -> bool {
        if !self.owns(entity.erased().as_ref()) {
            return false;
        }
        entity.id().is_some_and(|id| {
            self.tracked.tracker.is_dirty(
                &ObjectKey::of::<E>(&id),
                E::columns(),
                &entity.read().to_row(),
            )
        })
    }

    /// Are there queued writes or dirty managed entities?
    pub fn has_pending_changes(&self) -> bool {
        !self.queue.is_empty()
            || self
                .tracked
                .identity
                .entities()
                .iter()
                .filter(|(_, e)| e.state() == EntityState::Managed)
                .any(|(key, e)| self.tracked.tracker.is_dirty(key, e.columns(), &e.to_row()))
    }

    /// Number of entities in the identity map.
    pub fn managed_count(&self) -> usize {
        self.tracked.identity.len()
    }

    /// Number of queued INSERT/DELETE actions.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write all pending changes without ending the unit of work.
    ///
    /// If any statement fails the session becomes `Failed` and must be
    /// rolled back.
    #[tracing::instrument(level = "info", skip(self), fields(context = self.token.id()))]
    pub fn flush(&mut self) -> Result<FlushReport> {
        self.ensure_usable()?;
        let store = self.store.as_ref().ok_or_else(|| {
            Error::invalid(InvalidOperationKind::ContextClosed, "the session has ended")
        })?;
        let result = Flush {
            store,
            identity: &mut self.tracked.identity,
            tracker: &mut self.tracked.tracker,
            queue: &mut self.queue,
            auditing: &self.auditing,
            context_id: self.token.id(),
        }
        .run();
        if let Err(e) = &result {
            self.status = SessionStatus::Failed;
            tracing::warn!(error = %e, "flush failed; the session must be rolled back");
        }
        result
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn run_query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "query");
        self.store()?.query(&stmt.sql, &stmt.params)
    }

    fn load_rows<E: Entity>(
        &mut self,
        query: &Query<E>,
        stmt: &Statement,
    ) -> Result<Vec<EntityRef<E>>> {
        let rows = self.run_query(stmt)?;
        tracing::debug!(entity = E::NAME, rows = rows.len(), "query returned");
        let fetched = query.fetched_associations();
        let mut cx = LoadContext::new(&mut self.tracked, self.token.clone())
            .fetching(&fetched)
            .read_only(query.is_read_only());
        rows.iter().map(|row| cx.materialize::<E>(row)).collect()
    }

    /// All entities matching `query`, through the identity map.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn list<E: Entity>(&mut self, query: &Query<E>) -> Result<Vec<EntityRef<E>>> {
        self.ensure_usable()?;
        let stmt = query.select_statement(self.dialect()?, None)?;
        Ok(self
            .load_rows(query, &stmt)?
            .into_iter()
            .filter_map(visible)
            .collect())
    }

    /// The first entity matching `query`.
    pub fn first<E: Entity>(&mut self, query: &Query<E>) -> Result<Option<EntityRef<E>>> {
        self.ensure_usable()?;
        // Rows deleted in this session are skipped, so read past them.
        let window = keel_query::Window {
            offset: 0,
            limit: 1 + self.queue.count(flush::ActionKind::Delete) as u64,
        };
        let stmt = query.select_statement(self.dialect()?, Some(window))?;
        Ok(self
            .load_rows(query, &stmt)?
            .into_iter()
            .find_map(visible))
    }

    /// Number of rows matching `query`, via the join-free count statement.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn count<E: Entity>(&mut self, query: &Query<E>) -> Result<u64> {
        self.ensure_usable()?;
        let stmt = query.count_statement(self.dialect()?)?;
        let rows = self.run_query(&stmt)?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Custom("count statement returned no rows".to_string()))?;
        row.get_as::<u64>(0)
    }

    /// One page of `query` with its exact total.
    pub fn page<E: Entity>(
        &mut self,
        query: &Query<E>,
        request: &PageRequest,
    ) -> Result<Page<EntityRef<E>>> {
        self.page_with(query, request, CountPolicy::Exact)
    }

    /// One page of `query`; `policy` decides whether the total is counted.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME, policy = ?policy))]
    pub fn page_with<E: Entity>(
        &mut self,
        query: &Query<E>,
        request: &PageRequest,
        policy: CountPolicy,
    ) -> Result<Page<EntityRef<E>>> {
        self.ensure_usable()?;
        let window = request.window()?;
        let query = query.clone().sort(request.sort().clone());
        let stmt = query.select_statement(self.dialect()?, Some(window))?;
        let content = self.load_rows(&query, &stmt)?;

        let top = query.top();
        let reached_top = top.filter(|&t| window.offset + content.len() as u64 >= t);
        let page = match policy {
            CountPolicy::Skip => Page::uncounted(content, window),
            CountPolicy::Exact => {
                let total = match total_without_count(window, content.len()).or(reached_top) {
                    Some(total) => {
                        tracing::trace!(total, "total known from the page; count statement skipped");
                        total
                    }
                    None => self.count(&query)?,
                };
                Page::counted(content, window, total)
            }
        };
        let mut page = page.capped(top);
        page.retain(|e| e.state() != EntityState::Deleted);
        Ok(page)
    }

    /// One slice of `query`: fetches one extra row to learn `has_next`
    /// instead of counting.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME))]
    pub fn slice<E: Entity>(
        &mut self,
        query: &Query<E>,
        request: &PageRequest,
    ) -> Result<Slice<EntityRef<E>>> {
        self.ensure_usable()?;
        let window = request.window()?;
        let query = query.clone().sort(request.sort().clone());
        let stmt = query.select_statement(self.dialect()?, Some(Slice::<()>::probe(window)))?;
        let rows = self.load_rows(&query, &stmt)?;
        let mut slice = Slice::from_probe(rows, window);
        slice.retain(|e| e.state() != EntityState::Deleted);
        Ok(slice)
    }

    /// A single column of every matching row. Values are not entities and
    /// are never tracked.
    pub fn scalars<E: Entity, T: FromValue>(
        &mut self,
        query: &Query<E>,
        property: &str,
    ) -> Result<Vec<T>> {
        self.ensure_usable()?;
        let stmt = query.projection_statement(self.dialect()?, property, None)?;
        self.run_query(&stmt)?
            .iter()
            .map(|row| row.get_as::<T>(0))
            .collect()
    }

    /// Resolve a lazy association through this session.
    pub fn resolve<'a, T: Resolvable>(&mut self, association: &'a Association<T>) -> Result<&'a T> {
        association.resolve(self)
    }

    // ========================================================================
    // Bulk statements
    // ========================================================================

    /// Run a bulk UPDATE directly against the store.
    ///
    /// Managed entities whose rows match are **not** refreshed and become
    /// stale. The context is cleared afterwards only if
    /// `SessionConfig::clear_on_bulk` is set.
    pub fn bulk_update<E: Entity>(&mut self, update: &BulkUpdate<E>) -> Result<u64> {
        let options = BulkOptions {
            clear: self.config.clear_on_bulk,
        };
        self.bulk_update_with(update, options)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME, clear = options.clear))]
    pub fn bulk_update_with<E: Entity>(
        &mut self,
        update: &BulkUpdate<E>,
        options: BulkOptions,
    ) -> Result<u64> {
        self.ensure_usable()?;
        let stmt = update.statement(self.dialect()?)?;
        self.run_bulk::<E>(&stmt, options)
    }

    /// Run a bulk DELETE directly against the store. The same staleness
    /// caveat as [`Session::bulk_update`] applies.
    pub fn bulk_delete<E: Entity>(&mut self, delete: &BulkDelete<E>) -> Result<u64> {
        let options = BulkOptions {
            clear: self.config.clear_on_bulk,
        };
        self.bulk_delete_with(delete, options)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entity = E::NAME, clear = options.clear))]
    pub fn bulk_delete_with<E: Entity>(
        &mut self,
        delete: &BulkDelete<E>,
        options: BulkOptions,
    ) -> Result<u64> {
        self.ensure_usable()?;
        let stmt = delete.statement(self.dialect()?)?;
        self.run_bulk::<E>(&stmt, options)
    }

    fn run_bulk<E: Entity>(&mut self, stmt: &Statement, options: BulkOptions) -> Result<u64> {
        if self.config.flush_before_bulk && self.has_pending_changes() {
            tracing::debug!("flushing pending changes before bulk statement");
            self.flush()?;
        }

        let affected = self.store()?.execute(&stmt.sql, &stmt.params)?;
        tracing::info!(table = E::TABLE, affected, sql = %stmt.sql, "bulk statement executed");

        if options.clear {
            self.clear();
        } else {
            let managed = self.tracked.identity.count_of(TypeId::of::<E>());
            if managed > 0 && affected > 0 {
                tracing::warn!(
                    entity = E::NAME,
                    managed,
                    affected,
                    "bulk statement bypassed the session; managed entities may be stale"
                );
            }
        }
        Ok(affected)
    }

    // ========================================================================
    // Ending the unit of work
    // ========================================================================

    /// Flush (unless disabled), commit and return the store.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.token.id()))]
    pub fn commit(mut self) -> Result<S> {
        self.ensure_usable()?;
        if self.config.flush_on_commit {
            self.flush()?;
        }
        self.store()?.commit()?;
        self.finish()
    }

    /// Discard everything and roll back. Allowed after a failed flush.
    #[tracing::instrument(level = "debug", skip(self), fields(context = self.token.id()))]
    pub fn rollback(mut self) -> Result<S> {
        let result = self.store()?.rollback();
        let store = self.finish()?;
        result.map(|()| store)
    }

    /// End the unit of work either way.
    pub fn end(self, completion: Completion) -> Result<S> {
        match completion {
            Completion::Commit => self.commit(),
            Completion::Rollback => self.rollback(),
        }
    }

    /// Close the context token, detach everything and hand back the store.
    fn finish(&mut self) -> Result<S> {
        self.close();
        self.store.take().ok_or_else(|| {
            Error::invalid(InvalidOperationKind::ContextClosed, "the session has ended")
        })
    }

    fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.clear();
        self.token.close();
        self.status = SessionStatus::Closed;
        tracing::debug!(context = self.token.id(), "unit of work ended");
    }
}

/// Deleted entities are hidden from lookups.
fn visible<E: Entity>(entity: EntityRef<E>) -> Option<EntityRef<E>> {
    (entity.state() != EntityState::Deleted).then_some(entity)
}

impl<S: Store> AssociationLoader for Session<S> {
    fn context_token(&self) -> &ContextToken {
        &self.token
    }

    fn load_reference<E: Entity>(&mut self, id: &Value) -> Result<Option<EntityRef<E>>> {
        self.find::<E>(id.clone())
    }

    fn load_collection<E: Entity>(
        &mut self,
        column: &'static str,
        value: &Value,
    ) -> Result<Vec<EntityRef<E>>> {
        self.list(&Query::<E>::new().filter(col(column).eq(value.clone())))
    }
}

impl<S: Store> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            match store.rollback() {
                Ok(()) => tracing::debug!(
                    context = self.token.id(),
                    "session dropped while open; rolled back"
                ),
                Err(e) => tracing::warn!(
                    context = self.token.id(),
                    error = %e,
                    "rollback of dropped session failed"
                ),
            }
        }
        self.close();
    }
}

impl<S: Store> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.token.id())
            .field("status", &self.status)
            .field("managed", &self.tracked.identity.len())
            .field("pending", &self.queue.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
