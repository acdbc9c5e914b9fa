//! keel - a persistence context for Rust.
//!
//! keel maps structs to tables and tracks them through a unit of work:
//!
//! - One in-memory instance per row within a [`Session`] (identity map)
//! - Changes detected at flush by comparing against load-time snapshots
//! - Lazy to-one and to-many associations resolved through the session
//! - Derived queries with paging, slicing and join-free counts
//! - Bulk statements that bypass the identity map
//! - Audit stamping with an injected actor and clock
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw(MEMBER_DDL)?;
//!
//! let mut session = Session::begin(&conn)?;
//! let member = session.persist(Member::new("member1", 10))?;
//! session.flush()?;
//!
//! let adults = session.list(
//!     &Query::<Member>::new()
//!         .filter(col("age").ge(18))
//!         .order_by(OrderBy::desc("username")),
//! )?;
//!
//! let page = session.page(&Query::<Member>::new(), &PageRequest::of(0, 3))?;
//! assert!(page.is_first());
//!
//! member.modify(|m| m.age += 1)?;
//! session.commit()?; // one UPDATE, then COMMIT
//! ```
//!
//! # Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `keel-core` | `Value`, `Row`, `Entity`, `EntityRef`, associations, auditing, `Store` |
//! | `keel-query` | `Query`, `Expr`, `Sort`, paging types, bulk statements, CRUD rendering |
//! | `keel-session` | `Session`, identity map, change tracker, flush |
//! | `keel-sqlite` | `SqliteConnection`, the bundled SQLite store |

pub use keel_core::{
    AnyEntity, Association, AssociationInfo, AssociationKind, AssociationLoader, AuditInfo,
    AuditorProvider, Auditing, Clock, ColumnDef, ColumnInfo, ConnectionError,
    ConnectionErrorKind, ContextToken, Dialect, Entity, EntityRef, EntityState, Error,
    FieldValidationError, FixedAuditor, FromValue, IdGeneration, InvalidOperationError,
    InvalidOperationKind, LazyProxy, LoadContext, NoAuditor, ProxyState, QueryError,
    QueryErrorKind, Resolvable, Result, Row, StaleReferenceError, Statement, Store, SystemClock,
    ToMany, ToOne, TransactionError, TransactionErrorKind, TypeError, ValidationError,
    ValidationErrorKind, Value,
};
pub use keel_query::{
    BulkDelete, BulkUpdate, Direction, Expr, JoinType, LockMode, OrderBy, Page, PageRequest,
    Query, Slice, Sort, Window, col, lit,
};
pub use keel_session::{
    ActionKind, ActionRecord, BulkOptions, Completion, CountPolicy, FlushReport, Session,
    SessionConfig, SessionStatus,
};
pub use keel_sqlite::{OpenFlags, SqliteConfig, SqliteConnection};

/// The sub-crates, for items not re-exported at the top level.
pub use keel_core as core_crate;
pub use keel_query as query_crate;
pub use keel_session as session_crate;
pub use keel_sqlite as sqlite_crate;

/// Everything needed to map entities and work with a session.
pub mod prelude {
    pub use crate::{
        // Mapping
        AssociationInfo,
        AssociationKind,
        AuditInfo,
        Auditing,
        ColumnDef,
        Entity,
        IdGeneration,
        LoadContext,
        Row,
        ToMany,
        ToOne,
        Value,
        // Entities and errors
        EntityRef,
        EntityState,
        Error,
        Result,
        // Queries
        BulkDelete,
        BulkUpdate,
        Expr,
        LockMode,
        OrderBy,
        Page,
        PageRequest,
        Query,
        Slice,
        Sort,
        col,
        // Session and store
        BulkOptions,
        CountPolicy,
        Session,
        SessionConfig,
        SqliteConnection,
        Store,
    };
}

/// The keel version and the version of the linked SQLite library.
pub fn versions() -> (&'static str, &'static str) {
    (env!("CARGO_PKG_VERSION"), keel_sqlite::sqlite_version())
}
