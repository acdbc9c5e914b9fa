//! The entity trait and its mapping metadata.
//!
//! An entity is a plain struct with a stable identity column, scalar
//! columns and zero or more associations. Implementations are written by
//! hand; the metadata is `'static` so query builders can validate names
//! without an instance.

use crate::Result;
use crate::association::LoadContext;
use crate::audit::AuditInfo;
use crate::row::Row;
use crate::value::Value;

/// How an entity's identity is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// The store generates the identity on INSERT; it is unknown until flush.
    #[default]
    Generated,
    /// The caller assigns the identity before `save`.
    Assigned,
}

/// Mapping metadata for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name in the table.
    pub name: &'static str,
    /// Written by INSERT.
    pub insertable: bool,
    /// Written by UPDATE and compared by dirty checking.
    pub updatable: bool,
}

impl ColumnDef {
    /// An ordinary read/write column.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            insertable: true,
            updatable: true,
        }
    }

    /// A store-generated identity column.
    pub const fn generated_id(name: &'static str) -> Self {
        Self {
            name,
            insertable: false,
            updatable: false,
        }
    }

    /// A caller-assigned identity column, or any column fixed at INSERT.
    pub const fn insert_only(name: &'static str) -> Self {
        Self {
            name,
            insertable: true,
            updatable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// The owner's table holds the foreign key.
    ManyToOne,
    /// The target's table holds a foreign key back to the owner.
    OneToMany,
}

/// Mapping metadata for one association.
#[derive(Debug, Clone, Copy)]
pub struct AssociationInfo {
    /// Association (property) name on the owner.
    pub name: &'static str,
    pub kind: AssociationKind,
    /// Entity name of the target, for messages.
    pub target_entity: &'static str,
    pub target_table: &'static str,
    /// Primary key column of the target.
    pub target_key: &'static str,
    /// Foreign key column. On the owner table for `ManyToOne`, on the target
    /// table for `OneToMany`.
    pub join_column: &'static str,
    /// Columns of the target table, used to render fetch joins.
    pub target_columns: fn() -> &'static [ColumnDef],
}

impl AssociationInfo {
    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, AssociationKind::OneToMany)
    }
}

/// A type mapped to a table.
///
/// ```ignore
/// impl Entity for Team {
///     const NAME: &'static str = "Team";
///     const TABLE: &'static str = "team";
///     const PRIMARY_KEY: &'static str = "team_id";
///
///     fn columns() -> &'static [ColumnDef] {
///         const COLUMNS: &[ColumnDef] = &[
///             ColumnDef::generated_id("team_id"),
///             ColumnDef::new("name"),
///         ];
///         COLUMNS
///     }
///     // ...
/// }
/// ```
pub trait Entity: Sized + Send + Sync + 'static {
    /// Entity name used in messages and logs.
    const NAME: &'static str;

    /// The name of the database table.
    const TABLE: &'static str;

    /// The primary key column name.
    const PRIMARY_KEY: &'static str;

    /// Where identities come from.
    const ID_GENERATION: IdGeneration = IdGeneration::Generated;

    /// Association metadata. Entities without associations rely on the
    /// default empty slice.
    const ASSOCIATIONS: &'static [AssociationInfo] = &[];

    /// Column metadata, primary key included.
    fn columns() -> &'static [ColumnDef];

    /// The identity, if one has been assigned.
    fn id(&self) -> Option<Value>;

    /// Set the identity after a generated-key INSERT.
    fn set_id(&mut self, id: Value);

    /// Current column values, one entry per column in `columns()`.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a row.
    ///
    /// Associations are built through `cx`, which hands out lazy proxies
    /// bound to the loading context or entities already fetched with the row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row, cx: &mut LoadContext<'_>) -> Result<Self>;

    /// The embedded audit record, for entities that carry one.
    fn audit_mut(&mut self) -> Option<&mut AuditInfo> {
        None
    }

    /// Look up a column by name.
    fn column(name: &str) -> Option<&'static ColumnDef> {
        Self::columns().iter().find(|c| c.name == name)
    }

    /// Look up an association by name.
    fn association(name: &str) -> Option<&'static AssociationInfo> {
        Self::ASSOCIATIONS.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag {
        id: Option<i64>,
        label: String,
    }

    impl Entity for Tag {
        const NAME: &'static str = "Tag";
        const TABLE: &'static str = "tag";
        const PRIMARY_KEY: &'static str = "tag_id";

        fn columns() -> &'static [ColumnDef] {
            const COLUMNS: &[ColumnDef] = &[ColumnDef::generated_id("tag_id"), ColumnDef::new("label")];
            COLUMNS
        }

        fn id(&self) -> Option<Value> {
            self.id.map(Value::BigInt)
        }

        fn set_id(&mut self, id: Value) {
            self.id = id.as_i64();
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("tag_id", self.id.into()), ("label", self.label.clone().into())]
        }

        fn from_row(row: &Row, _cx: &mut LoadContext<'_>) -> Result<Self> {
            Ok(Self {
                id: row.get_named("tag_id")?,
                label: row.get_named("label")?,
            })
        }
    }

    #[test]
    fn defaults_and_lookups() {
        assert_eq!(Tag::ID_GENERATION, IdGeneration::Generated);
        assert!(Tag::ASSOCIATIONS.is_empty());
        assert!(Tag::association("anything").is_none());

        let id = Tag::column("tag_id").unwrap();
        assert!(!id.insertable && !id.updatable);
        assert!(Tag::column("label").unwrap().updatable);
        assert!(Tag::column("missing").is_none());
    }

    #[test]
    fn set_id_after_insert() {
        let mut tag = Tag {
            id: None,
            label: "rust".into(),
        };
        assert_eq!(tag.id(), None);
        tag.set_id(Value::BigInt(4));
        assert_eq!(tag.id(), Some(Value::BigInt(4)));
        assert_eq!(tag.to_row()[0], ("tag_id", Value::BigInt(4)));
        assert!(tag.audit_mut().is_none());
    }
}
