//! Query specifications.
//!
//! A `Query<E>` states what to read: a predicate, joins, fetch joins,
//! ordering, an optional top-N limit, a lock mode and the read-only hint.
//! It renders the row statement, the count statement used for paging and
//! single-column projections.

use crate::clause::{OrderBy, Sort};
use crate::crud::{TableInfo, select_list};
use crate::expr::Expr;
use crate::ident::PropertyPath;
use keel_core::{
    AssociationInfo, AssociationKind, Dialect, Entity, Result, Statement, ValidationError,
    ValidationErrorKind,
};
use std::fmt;
use std::marker::PhantomData;

/// Row locking requested by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    None,
    /// `SELECT ... FOR UPDATE` where the dialect has it.
    PessimisticWrite,
}

impl LockMode {
    /// SQL appended to a SELECT for this lock mode.
    pub fn suffix(self, dialect: Dialect) -> &'static str {
        match self {
            LockMode::PessimisticWrite if dialect.supports_for_update() => " FOR UPDATE",
            _ => "",
        }
    }
}

/// Types of joins a query can add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// A row window: skip `offset` rows, return at most `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy)]
struct JoinSpec {
    association: &'static AssociationInfo,
    join_type: JoinType,
    fetch: bool,
}

impl JoinSpec {
    fn alias(&self) -> &'static str {
        self.association.name
    }

    fn to_sql(&self, dialect: Dialect, root: &str, root_key: &str) -> String {
        let info = self.association;
        let alias = dialect.quote_identifier(info.name);
        let on = match info.kind {
            AssociationKind::ManyToOne => format!(
                "{alias}.{} = {}.{}",
                dialect.quote_identifier(info.target_key),
                dialect.quote_identifier(root),
                dialect.quote_identifier(info.join_column)
            ),
            AssociationKind::OneToMany => format!(
                "{alias}.{} = {}.{}",
                dialect.quote_identifier(info.join_column),
                dialect.quote_identifier(root),
                dialect.quote_identifier(root_key)
            ),
        };
        format!(
            " {} {} AS {alias} ON {on}",
            self.join_type.as_str(),
            dialect.quote_identifier(info.target_table)
        )
    }
}

/// What to read for entity type `E`.
pub struct Query<E: Entity> {
    filter: Option<Expr>,
    joins: Vec<JoinSpec>,
    sort: Sort,
    limit: Option<u64>,
    lock: LockMode,
    read_only: bool,
    errors: ValidationError,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Query<E> {
    /// Every row of `E`'s table.
    pub fn new() -> Self {
        Self {
            filter: None,
            joins: Vec::new(),
            sort: Sort::unsorted(),
            limit: None,
            lock: LockMode::None,
            read_only: false,
            errors: ValidationError::new(),
            _entity: PhantomData,
        }
    }

    /// Add a predicate; multiple calls are ANDed.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Inner join an association so predicates can reference it as
    /// `association.column`.
    pub fn join(self, association: &str) -> Self {
        self.add_join(association, JoinType::Inner, false)
    }

    /// Left join an association.
    pub fn left_join(self, association: &str) -> Self {
        self.add_join(association, JoinType::Left, false)
    }

    /// Load a to-one association eagerly in the same statement.
    pub fn fetch(self, association: &str) -> Self {
        self.add_join(association, JoinType::Left, true)
    }

    fn add_join(mut self, name: &str, join_type: JoinType, fetch: bool) -> Self {
        let Some(association) = E::association(name) else {
            self.errors.add(
                name,
                ValidationErrorKind::UnknownProperty,
                format!("no association '{name}' found for type '{}'", E::NAME),
            );
            return self;
        };
        if fetch && association.is_collection() {
            self.errors.add(
                name,
                ValidationErrorKind::UnknownProperty,
                format!(
                    "'{}.{name}' is a collection and cannot be fetch-joined",
                    E::NAME
                ),
            );
            return self;
        }
        if let Some(existing) = self.joins.iter_mut().find(|j| j.alias() == association.name) {
            existing.fetch |= fetch;
            if join_type == JoinType::Inner {
                existing.join_type = JoinType::Inner;
            }
            return self;
        }
        self.joins.push(JoinSpec {
            association,
            join_type,
            fetch,
        });
        self
    }

    /// Append one ORDER BY term.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.sort = self.sort.and(order.into());
        self
    }

    /// Append ORDER BY terms.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = self.sort.and(sort);
        self
    }

    /// Return at most `n` rows (top-N).
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    /// Results are not snapshotted and never dirty-checked.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn sort_terms(&self) -> &Sort {
        &self.sort
    }

    pub fn top(&self) -> Option<u64> {
        self.limit
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Associations loaded by fetch joins, in join order.
    pub fn fetched_associations(&self) -> Vec<&'static str> {
        self.joins
            .iter()
            .filter(|j| j.fetch)
            .map(JoinSpec::alias)
            .collect()
    }

    fn joined(&self, alias: &str) -> Option<&JoinSpec> {
        self.joins.iter().find(|j| j.alias() == alias)
    }

    /// Check every name against `E`'s mapping.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut err = self.errors.clone();

        if let Some(filter) = &self.filter {
            if let Err(e) = filter.check() {
                err.errors.extend(e.errors);
            }
            for (table, column) in filter.column_refs() {
                self.check_column(table, column, &mut err);
            }
        }

        for order in self.sort.orders() {
            match PropertyPath::parse(&order.property) {
                Ok(path) => {
                    self.check_column(path.association.as_deref(), &path.column, &mut err);
                }
                Err(e) => err.errors.extend(e.errors),
            }
        }

        err.into_result()
    }

    fn check_column(&self, table: Option<&str>, column: &str, err: &mut ValidationError) {
        let known = match table {
            None => E::column(column).is_some(),
            Some(t) if t == E::TABLE => E::column(column).is_some(),
            Some(alias) => self.joined(alias).is_some_and(|j| {
                (j.association.target_columns)()
                    .iter()
                    .any(|c| c.name == column)
            }),
        };
        if !known {
            let property = match table {
                Some(t) if t != E::TABLE => format!("{t}.{column}"),
                _ => column.to_string(),
            };
            err.add_unknown_property(&property, E::NAME);
        }
    }

    fn from_clause(&self, dialect: Dialect, include: impl Fn(&JoinSpec) -> bool) -> String {
        let mut sql = format!("FROM {}", dialect.quote_identifier(E::TABLE));
        for join in self.joins.iter().filter(|j| include(j)) {
            sql.push_str(&join.to_sql(dialect, E::TABLE, E::PRIMARY_KEY));
        }
        sql
    }

    fn where_clause(&self, dialect: Dialect, params: &mut Vec<keel_core::Value>) -> String {
        match &self.filter {
            Some(filter) => format!(
                " WHERE {}",
                filter
                    .qualify(E::TABLE)
                    .build_with_dialect(dialect, params, 0)
            ),
            None => String::new(),
        }
    }

    fn order_clause(&self, dialect: Dialect) -> Result<String> {
        if self.sort.is_empty() {
            return Ok(String::new());
        }
        let terms = self
            .sort
            .orders()
            .iter()
            .map(|o| o.to_sql(dialect, E::TABLE))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(format!(" ORDER BY {}", terms.join(", ")))
    }

    fn limit_clause(&self, window: Option<Window>) -> String {
        let (offset, limit) = match (window, self.limit) {
            (Some(w), Some(top)) => (w.offset, Some(w.limit.min(top.saturating_sub(w.offset)))),
            (Some(w), None) => (w.offset, Some(w.limit)),
            (None, top) => (0, top),
        };
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    fn distinct(&self, include: impl Fn(&JoinSpec) -> bool) -> bool {
        self.joins
            .iter()
            .any(|j| include(j) && j.association.is_collection())
    }

    /// The statement returning entity rows, optionally windowed.
    ///
    /// A window is clamped to the top-N limit when both are present.
    pub fn select_statement(&self, dialect: Dialect, window: Option<Window>) -> Result<Statement> {
        self.validate()?;

        let mut columns = TableInfo::of::<E>().select_list(dialect, E::TABLE, None);
        for join in self.joins.iter().filter(|j| j.fetch) {
            columns.push_str(", ");
            columns.push_str(&select_list(
                dialect,
                join.alias(),
                (join.association.target_columns)(),
                Some(join.alias()),
            ));
        }

        let mut params = Vec::new();
        let distinct = if self.distinct(|_| true) { "DISTINCT " } else { "" };
        let mut sql = format!("SELECT {distinct}{columns} {}", self.from_clause(dialect, |_| true));
        sql.push_str(&self.where_clause(dialect, &mut params));
        sql.push_str(&self.order_clause(dialect)?);
        sql.push_str(&self.limit_clause(window));
        sql.push_str(self.lock.suffix(dialect));
        Ok(Statement::new(sql, params))
    }

    /// The statement counting matching rows.
    ///
    /// Derived from the same predicate with ORDER BY, LIMIT and OFFSET
    /// removed, fetch joins removed, and every LEFT join the predicate does
    /// not reference removed. Inner joins stay because they filter rows.
    pub fn count_statement(&self, dialect: Dialect) -> Result<Statement> {
        self.validate()?;

        let referenced: Vec<&str> = self
            .filter
            .as_ref()
            .map(|f| f.referenced_tables().into_iter().collect())
            .unwrap_or_default();
        let keep = |j: &JoinSpec| {
            referenced.contains(&j.alias()) || (!j.fetch && j.join_type == JoinType::Inner)
        };

        let count = if self.distinct(keep) {
            format!(
                "COUNT(DISTINCT {}.{})",
                dialect.quote_identifier(E::TABLE),
                dialect.quote_identifier(E::PRIMARY_KEY)
            )
        } else {
            "COUNT(*)".to_string()
        };

        let mut params = Vec::new();
        let mut sql = format!("SELECT {count} {}", self.from_clause(dialect, keep));
        sql.push_str(&self.where_clause(dialect, &mut params));
        tracing::trace!(entity = E::NAME, sql = %sql, "derived count statement");
        Ok(Statement::new(sql, params))
    }

    /// A single-column projection over the same rows.
    pub fn projection_statement(
        &self,
        dialect: Dialect,
        property: &str,
        window: Option<Window>,
    ) -> Result<Statement> {
        self.validate()?;
        let path = PropertyPath::parse(property)?;
        let mut err = ValidationError::new();
        self.check_column(path.association.as_deref(), &path.column, &mut err);
        err.into_result()?;

        let table = path.association.as_deref().unwrap_or(E::TABLE);
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT {}.{} {}",
            dialect.quote_identifier(table),
            dialect.quote_identifier(&path.column),
            self.from_clause(dialect, |_| true)
        );
        sql.push_str(&self.where_clause(dialect, &mut params));
        sql.push_str(&self.order_clause(dialect)?);
        sql.push_str(&self.limit_clause(window));
        Ok(Statement::new(sql, params))
    }
}

impl<E: Entity> Default for Query<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            joins: self.joins.clone(),
            sort: self.sort.clone(),
            limit: self.limit,
            lock: self.lock,
            read_only: self.read_only,
            errors: self.errors.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity", &E::NAME)
            .field("filter", &self.filter)
            .field("joins", &self.joins)
            .field("sort", &self.sort)
            .field("limit", &self.limit)
            .field("lock", &self.lock)
            .field("read_only", &self.read_only)
            .finish()
    }
}
