//! The synchronous statement-execution interface keel runs on.
//!
//! A `Store` is one connection with at most one open unit of work. The
//! persistence context never talks to a database any other way.

use crate::Result;
use crate::row::Row;
use crate::value::Value;
use std::sync::Arc;

/// SQL dialect spoken by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    #[default]
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Does `SELECT ... FOR UPDATE` exist in this dialect?
    ///
    /// SQLite has no row locks; writers are serialised when the unit of work
    /// begins, so the clause is simply omitted there.
    pub const fn supports_for_update(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Mysql)
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
        }
    }
}

/// A pre-built statement: SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A relational store reachable through synchronous statement execution.
///
/// Methods take `&self`; implementations serialise access internally the
/// way a single database handle does.
pub trait Store {
    /// The dialect statements must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the generated key.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Begin a unit of work.
    fn begin(&self) -> Result<()>;

    /// Commit the current unit of work.
    fn commit(&self) -> Result<()>;

    /// Roll back the current unit of work.
    fn rollback(&self) -> Result<()>;
}

macro_rules! forward_store {
    ($($ty:ty),*) => {$(
        impl<S: Store + ?Sized> Store for $ty {
            fn dialect(&self) -> Dialect {
                (**self).dialect()
            }

            fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
                (**self).query(sql, params)
            }

            fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
                (**self).execute(sql, params)
            }

            fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
                (**self).insert(sql, params)
            }

            fn begin(&self) -> Result<()> {
                (**self).begin()
            }

            fn commit(&self) -> Result<()> {
                (**self).commit()
            }

            fn rollback(&self) -> Result<()> {
                (**self).rollback()
            }
        }
    )*};
}

forward_store!(&S, Box<S>, Arc<S>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(1), "$1");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(3), "?");
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(Dialect::Sqlite.quote_identifier("member"), "\"member\"");
        assert_eq!(Dialect::Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_for_update_support() {
        assert!(!Dialect::Sqlite.supports_for_update());
        assert!(Dialect::Postgres.supports_for_update());
    }
}
