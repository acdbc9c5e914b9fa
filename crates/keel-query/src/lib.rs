//! Query construction layer for keel.
//!
//! `keel-query` turns caller intent into pre-built statements the
//! persistence context can execute. Nothing is inferred from method names:
//!
//! - **Predicates**: `Expr` builds WHERE clauses and bulk mutations.
//! - **Query specifications**: `Query<E>` adds joins, fetch joins, sorting,
//!   top-N limits, a lock mode and the read-only hint.
//! - **Paging**: `PageRequest`, `Page` and `Slice`, plus the join-free count
//!   statement derived from a query.
//! - **Bulk statements**: `BulkUpdate` and `BulkDelete`.
//! - **CRUD**: the INSERT/UPDATE/DELETE/SELECT-by-id statements a flush runs.

pub mod bulk;
pub mod clause;
pub mod crud;
pub mod expr;
pub mod ident;
pub mod page;
pub mod query;

pub use bulk::{BulkDelete, BulkUpdate};
pub use clause::{Direction, OrderBy, Sort};
pub use crud::TableInfo;
pub use expr::{BinaryOp, Expr, col, lit};
pub use page::{Page, PageRequest, Slice, total_without_count};
pub use query::{JoinType, LockMode, Query, Window};

#[cfg(test)]
pub(crate) mod fixtures;
