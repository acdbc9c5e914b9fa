//! Core types and traits for keel.
//!
//! This crate provides the vocabulary every other keel crate speaks:
//!
//! - `Value` and `Row` for data moving to and from the store
//! - `Entity` trait describing how a struct maps to a table
//! - `EntityRef` handles shared by the identity map and callers
//! - `Association` lazy proxies with explicit resolution
//! - `AuditInfo` and the injected auditor capability
//! - `Store` trait for the synchronous statement-execution interface

pub mod association;
pub mod audit;
pub mod entity;
pub mod error;
pub mod managed;
pub mod row;
pub mod store;
pub mod value;

pub use association::{
    Association, AssociationLoader, ContextToken, EntityCache, LazyProxy, LoadContext, ProxyKey,
    ProxyOrigin, ProxyState, Resolvable, ToMany, ToOne,
};
pub use audit::{AuditInfo, AuditorProvider, Auditing, Clock, FixedAuditor, NoAuditor, SystemClock};
pub use entity::{AssociationInfo, AssociationKind, ColumnDef, Entity, IdGeneration};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, FieldValidationError, InvalidOperationError,
    InvalidOperationKind, QueryError, QueryErrorKind, Result, StaleReferenceError,
    TransactionError, TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use managed::{AnyEntity, EntityReadGuard, EntityRef, EntityState, EntityWriteGuard};
pub use row::{ColumnInfo, FromValue, Row};
pub use store::{Dialect, Statement, Store};
pub use value::Value;
