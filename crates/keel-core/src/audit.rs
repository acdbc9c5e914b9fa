//! Audit columns embedded in entities by composition.
//!
//! The actor and the clock are capabilities handed to the persistence
//! context when a unit of work starts; nothing here reads ambient state.

use crate::Result;
use crate::entity::ColumnDef;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Who is acting in the current unit of work.
pub trait AuditorProvider: Send + Sync {
    fn current_auditor(&self) -> Option<String>;
}

/// Source of audit timestamps, in microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Always reports the same actor.
#[derive(Debug, Clone)]
pub struct FixedAuditor(pub String);

impl FixedAuditor {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }
}

impl AuditorProvider for FixedAuditor {
    fn current_auditor(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// No actor; `created_by`/`updated_by` stay empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuditor;

impl AuditorProvider for NoAuditor {
    fn current_auditor(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

/// The auditing capabilities of one persistence context.
#[derive(Clone)]
pub struct Auditing {
    pub provider: Arc<dyn AuditorProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Auditing {
    pub fn new(provider: impl AuditorProvider + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
            clock: Arc::new(clock),
        }
    }

    /// Record the given actor, timestamps from the system clock.
    pub fn with_actor(actor: impl Into<String>) -> Self {
        Self::new(FixedAuditor::new(actor), SystemClock)
    }
}

impl Default for Auditing {
    fn default() -> Self {
        Self::new(NoAuditor, SystemClock)
    }
}

impl fmt::Debug for Auditing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auditing")
            .field("actor", &self.provider.current_auditor())
            .finish_non_exhaustive()
    }
}

/// Created/updated timestamps and actors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl AuditInfo {
    pub const CREATED_AT: ColumnDef = ColumnDef::insert_only("created_at");
    pub const UPDATED_AT: ColumnDef = ColumnDef::new("updated_at");
    pub const CREATED_BY: ColumnDef = ColumnDef::insert_only("created_by");
    pub const UPDATED_BY: ColumnDef = ColumnDef::new("updated_by");

    /// Stamp every field; called when an INSERT is enqueued.
    pub fn on_insert(&mut self, auditing: &Auditing) {
        let now = auditing.clock.now_micros();
        let actor = auditing.provider.current_auditor();
        self.created_at = Some(now);
        self.updated_at = Some(now);
        self.created_by.clone_from(&actor);
        self.updated_by = actor;
    }

    /// Stamp the `updated_*` fields; called when an UPDATE is enqueued.
    pub fn on_update(&mut self, auditing: &Auditing) {
        self.updated_at = Some(auditing.clock.now_micros());
        self.updated_by = auditing.provider.current_auditor();
    }

    /// Append the audit columns to an entity row.
    pub fn write_columns(&self, row: &mut Vec<(&'static str, Value)>) {
        row.push((
            Self::CREATED_AT.name,
            self.created_at.map_or(Value::Null, Value::Timestamp),
        ));
        row.push((
            Self::UPDATED_AT.name,
            self.updated_at.map_or(Value::Null, Value::Timestamp),
        ));
        row.push((Self::CREATED_BY.name, self.created_by.clone().into()));
        row.push((Self::UPDATED_BY.name, self.updated_by.clone().into()));
    }

    /// Read the audit columns back from a row.
    #[allow(clippy::result_large_err)]
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            created_at: row.get_named(Self::CREATED_AT.name)?,
            updated_at: row.get_named(Self::UPDATED_AT.name)?,
            created_by: row.get_named(Self::CREATED_BY.name)?,
            updated_by: row.get_named(Self::UPDATED_BY.name)?,
        })
    }
}
