//! Single-entity statements issued by flush and by lookups.
//!
//! These work from table metadata rather than a concrete entity type so the
//! flush can render statements for type-erased managed instances.

use crate::query::LockMode;
use keel_core::{AnyEntity, ColumnDef, Dialect, Entity, IdGeneration, Statement, Value};

/// Table-level mapping metadata.
#[derive(Debug, Clone, Copy)]
pub struct TableInfo {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [ColumnDef],
    pub id_generation: IdGeneration,
}

impl TableInfo {
    pub fn of<E: Entity>() -> Self {
        Self {
            name: E::TABLE,
            primary_key: E::PRIMARY_KEY,
            columns: E::columns(),
            id_generation: E::ID_GENERATION,
        }
    }

    pub fn of_erased(entity: &dyn AnyEntity) -> Self {
        Self {
            name: entity.table(),
            primary_key: entity.primary_key(),
            columns: entity.columns(),
            id_generation: entity.id_generation(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `"t"."a" AS "a", "t"."b" AS "b", ...` for every mapped column.
    pub fn select_list(&self, dialect: Dialect, alias: &str, prefix: Option<&str>) -> String {
        select_list(dialect, alias, self.columns, prefix)
    }
}

/// Select list for `columns` read through `alias`.
///
/// With a prefix every column is labelled `{prefix}__{column}`, which is how
/// fetch-joined entities are told apart from the root in one result row.
pub fn select_list(
    dialect: Dialect,
    alias: &str,
    columns: &[ColumnDef],
    prefix: Option<&str>,
) -> String {
    columns
        .iter()
        .map(|c| {
            let label = match prefix {
                Some(p) => format!("{p}__{}", c.name),
                None => c.name.to_string(),
            };
            format!(
                "{}.{} AS {}",
                dialect.quote_identifier(alias),
                dialect.quote_identifier(c.name),
                dialect.quote_identifier(&label)
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// INSERT of the insertable columns in `row`.
///
/// With a generated identity on Postgres the key comes back via RETURNING;
/// other dialects report it through the store's `insert`.
pub fn insert(dialect: Dialect, table: &TableInfo, row: &[(&'static str, Value)]) -> Statement {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut params = Vec::new();
    for (name, value) in row {
        if !table.column(name).is_some_and(|c| c.insertable) {
            continue;
        }
        params.push(value.clone());
        columns.push(dialect.quote_identifier(name));
        placeholders.push(dialect.placeholder(params.len()));
    }

    let mut sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", dialect.quote_identifier(table.name))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote_identifier(table.name),
            columns.join(", "),
            placeholders.join(", ")
        )
    };
    if dialect == Dialect::Postgres && table.id_generation == IdGeneration::Generated {
        sql.push_str(&format!(
            " RETURNING {}",
            dialect.quote_identifier(table.primary_key)
        ));
    }
    Statement::new(sql, params)
}

/// UPDATE of every updatable column in `row`, keyed by `id`.
///
/// Returns `None` when the entity has no updatable columns.
pub fn update(
    dialect: Dialect,
    table: &TableInfo,
    row: &[(&'static str, Value)],
    id: &Value,
) -> Option<Statement> {
    let mut sets = Vec::new();
    let mut params = Vec::new();
    for (name, value) in row {
        if !table.column(name).is_some_and(|c| c.updatable) {
            continue;
        }
        params.push(value.clone());
        sets.push(format!(
            "{} = {}",
            dialect.quote_identifier(name),
            dialect.placeholder(params.len())
        ));
    }
    if sets.is_empty() {
        return None;
    }
    params.push(id.clone());
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        dialect.quote_identifier(table.name),
        sets.join(", "),
        dialect.quote_identifier(table.primary_key),
        dialect.placeholder(params.len())
    );
    Some(Statement::new(sql, params))
}

/// DELETE by identity.
pub fn delete(dialect: Dialect, table: &TableInfo, id: &Value) -> Statement {
    let sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        dialect.quote_identifier(table.name),
        dialect.quote_identifier(table.primary_key),
        dialect.placeholder(1)
    );
    Statement::new(sql, vec![id.clone()])
}

/// SELECT one row by identity.
pub fn select_by_id(dialect: Dialect, table: &TableInfo, id: &Value, lock: LockMode) -> Statement {
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}.{} = {}",
        table.select_list(dialect, table.name, None),
        dialect.quote_identifier(table.name),
        dialect.quote_identifier(table.name),
        dialect.quote_identifier(table.primary_key),
        dialect.placeholder(1)
    );
    sql.push_str(lock.suffix(dialect));
    Statement::new(sql, vec![id.clone()])
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[ColumnDef] = &[
        ColumnDef::generated_id("member_id"),
        ColumnDef::new("username"),
        ColumnDef::new("age"),
        ColumnDef::insert_only("created_at"),
    ];

    fn member_table() -> TableInfo {
        TableInfo {
            name: "member",
            primary_key: "member_id",
            columns: COLUMNS,
            id_generation: IdGeneration::Generated,
        }
    }

    fn member_row() -> Vec<(&'static str, Value)> {
        vec![
            ("member_id", Value::Null),
            ("username", Value::Text("member1".into())),
            ("age", Value::Int(10)),
            ("created_at", Value::Timestamp(5)),
        ]
    }

    #[test]
    fn insert_skips_generated_id() {
        let stmt = insert(Dialect::Sqlite, &member_table(), &member_row());
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"member\" (\"username\", \"age\", \"created_at\") VALUES (?1, ?2, ?3)"
        );
        assert_eq!(stmt.params.len(), 3);

        let pg = insert(Dialect::Postgres, &member_table(), &member_row());
        assert!(pg.sql.ends_with("RETURNING \"member_id\""));
    }

    #[test]
    fn update_writes_only_updatable_columns() {
        let stmt = update(
            Dialect::Sqlite,
            &member_table(),
            &member_row(),
            &Value::BigInt(1),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"member\" SET \"username\" = ?1, \"age\" = ?2 WHERE \"member_id\" = ?3"
        );
        assert_eq!(stmt.params[2], Value::BigInt(1));
    }

    #[test]
    fn delete_and_select_by_id() {
        let del = delete(Dialect::Sqlite, &member_table(), &Value::BigInt(4));
        assert_eq!(del.sql, "DELETE FROM \"member\" WHERE \"member_id\" = ?1");

        let sel = select_by_id(
            Dialect::Sqlite,
            &member_table(),
            &Value::BigInt(4),
            LockMode::PessimisticWrite,
        );
        assert!(sel.sql.starts_with("SELECT \"member\".\"member_id\" AS \"member_id\""));
        assert!(!sel.sql.contains("FOR UPDATE"));

        let pg = select_by_id(
            Dialect::Postgres,
            &member_table(),
            &Value::BigInt(4),
            LockMode::PessimisticWrite,
        );
        assert!(pg.sql.ends_with("WHERE \"member\".\"member_id\" = $1 FOR UPDATE"));
    }
}
