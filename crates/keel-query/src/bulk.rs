//! Bulk UPDATE and DELETE statements.
//!
//! These run straight against the store. Managed instances whose rows match
//! are NOT refreshed; the session documents and optionally clears them.

use crate::expr::Expr;
use keel_core::{Dialect, Entity, Result, Statement, ValidationError, ValidationErrorKind};
use std::fmt;
use std::marker::PhantomData;

/// `UPDATE <table> SET ... WHERE ...` for entity type `E`.
pub struct BulkUpdate<E: Entity> {
    sets: Vec<(String, Expr)>,
    filter: Option<Expr>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> BulkUpdate<E> {
    pub fn new() -> Self {
        Self {
            sets: Vec::new(),
            filter: None,
            _entity: PhantomData,
        }
    }

    /// Assign `value` to `column`. The value may reference other columns,
    /// e.g. `col("age").add(1)`.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.sets.push((column.into(), value.into()));
        self
    }

    /// Restrict the rows touched; multiple calls are ANDed.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut err = ValidationError::new();
        if self.sets.is_empty() {
            err.add(
                "set",
                ValidationErrorKind::EmptyMutation,
                format!("bulk update of '{}' has no SET clause", E::NAME),
            );
        }
        for (column, value) in &self.sets {
            match E::column(column) {
                Some(def) if def.updatable => {}
                Some(_) => err.add(
                    column.clone(),
                    ValidationErrorKind::UnknownProperty,
                    format!("column '{column}' of '{}' is not updatable", E::NAME),
                ),
                None => err.add_unknown_property(column, E::NAME),
            }
            check_expr::<E>(value, &mut err);
        }
        if let Some(filter) = &self.filter {
            check_expr::<E>(filter, &mut err);
        }
        err.into_result()
    }

    /// Render the statement.
    pub fn statement(&self, dialect: Dialect) -> Result<Statement> {
        self.validate()?;
        let mut params = Vec::new();
        let sets = self
            .sets
            .iter()
            .map(|(column, value)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    value.build_with_dialect(dialect, &mut params, 0)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE {} SET {sets}", dialect.quote_identifier(E::TABLE));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build_with_dialect(dialect, &mut params, 0));
        }
        Ok(Statement::new(sql, params))
    }
}

/// `DELETE FROM <table> WHERE ...` for entity type `E`.
pub struct BulkDelete<E: Entity> {
    filter: Option<Expr>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> BulkDelete<E> {
    /// Delete every row of the table.
    pub fn all() -> Self {
        Self {
            filter: None,
            _entity: PhantomData,
        }
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut err = ValidationError::new();
        if let Some(filter) = &self.filter {
            check_expr::<E>(filter, &mut err);
        }
        err.into_result()
    }

    pub fn statement(&self, dialect: Dialect) -> Result<Statement> {
        self.validate()?;
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(E::TABLE));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build_with_dialect(dialect, &mut params, 0));
        }
        Ok(Statement::new(sql, params))
    }
}

/// Bulk statements address a single table, so every column must be one of
/// `E`'s, bare or qualified with its table name.
fn check_expr<E: Entity>(expr: &Expr, err: &mut ValidationError) {
    if let Err(e) = expr.check() {
        err.errors.extend(e.errors);
        return;
    }
    for (table, column) in expr.column_refs() {
        let known = table.is_none_or(|t| t == E::TABLE) && E::column(column).is_some();
        if !known {
            let property = match table {
                Some(t) => format!("{t}.{column}"),
                None => column.to_string(),
            };
            err.add_unknown_property(&property, E::NAME);
        }
    }
}

impl<E: Entity> Default for BulkUpdate<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Default for BulkDelete<E> {
    fn default() -> Self {
        Self::all()
    }
}

impl<E: Entity> Clone for BulkUpdate<E> {
    fn clone(&self) -> Self {
        Self {
            sets: self.sets.clone(),
            filter: self.filter.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Clone for BulkDelete<E> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for BulkUpdate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkUpdate")
            .field("entity", &E::NAME)
            .field("sets", &self.sets)
            .field("filter", &self.filter)
            .finish()
    }
}

impl<E: Entity> fmt::Debug for BulkDelete<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDelete")
            .field("entity", &E::NAME)
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::fixtures::Member;
    use keel_core::Value;

    #[test]
    fn age_plus_one() {
        let stmt = BulkUpdate::<Member>::new()
            .set("age", col("age").add(1))
            .filter(col("age").ge(20))
            .statement(Dialect::Sqlite)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"member\" SET \"age\" = \"age\" + ?1 WHERE \"age\" >= ?2"
        );
        assert_eq!(stmt.params, vec![Value::Int(1), Value::Int(20)]);

        let pg = BulkUpdate::<Member>::new()
            .set("age", col("age").add(1))
            .filter(col("age").ge(20))
            .statement(Dialect::Postgres)
            .unwrap();
        assert!(pg.sql.ends_with("\"age\" + $1 WHERE \"age\" >= $2"));
    }

    #[test]
    fn update_without_set_is_rejected() {
        let err = BulkUpdate::<Member>::new()
            .filter(col("age").ge(20))
            .statement(Dialect::Sqlite)
            .unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::EmptyMutation));
    }

    #[test]
    fn unknown_or_fixed_columns_are_rejected() {
        let err = BulkUpdate::<Member>::new()
            .set("nickname", "x")
            .validate()
            .unwrap_err();
        assert_eq!(err.first_kind(), Some(ValidationErrorKind::UnknownProperty));

        // The identity column is never updatable.
        assert!(BulkUpdate::<Member>::new().set("member_id", 5).validate().is_err());

        let err = BulkDelete::<Member>::all()
            .filter(col("team.name").eq("x"))
            .validate()
            .unwrap_err();
        assert_eq!(err.first_kind(), Some(ValidationErrorKind::InvalidIdentifier));
    }

    #[test]
    fn delete_with_and_without_filter() {
        let all = BulkDelete::<Member>::all().statement(Dialect::Sqlite).unwrap();
        assert_eq!(all.sql, "DELETE FROM \"member\"");
        assert!(all.params.is_empty());

        let some = BulkDelete::<Member>::all()
            .filter(col("username").in_list(["a", "b"]))
            .statement(Dialect::Sqlite)
            .unwrap();
        assert_eq!(
            some.sql,
            "DELETE FROM \"member\" WHERE \"username\" IN (?1, ?2)"
        );

        let err = BulkDelete::<Member>::all()
            .filter(col("username").in_list(Vec::<&str>::new()))
            .statement(Dialect::Sqlite)
            .unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::EmptyPredicate));
    }
}
