//! Test entities and a recording mock store.

use keel_core::{
    AssociationInfo, AssociationKind, AuditInfo, ColumnDef, Dialect, Entity, Error, IdGeneration,
    LoadContext, QueryError, QueryErrorKind, Result, Row, Store, ToMany, ToOne, Value,
};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub members: ToMany<Member>,
}

#[derive(Debug)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: ToOne<Team>,
    pub audit: AuditInfo,
}

pub fn member(id: Option<i64>, username: &str, age: i32) -> Member {
    Member {
        id,
        username: username.to_string(),
        age,
        team: ToOne::none(),
        audit: AuditInfo::default(),
    }
}

const TEAM_COLUMNS: &[ColumnDef] = &[ColumnDef::generated_id("team_id"), ColumnDef::new("name")];

const MEMBER_COLUMNS: &[ColumnDef] = &[
    ColumnDef::generated_id("member_id"),
    ColumnDef::new("username"),
    ColumnDef::new("age"),
    ColumnDef::new("team_id"),
    AuditInfo::CREATED_AT,
    AuditInfo::UPDATED_AT,
    AuditInfo::CREATED_BY,
    AuditInfo::UPDATED_BY,
];

const TEAM_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo {
    name: "members",
    kind: AssociationKind::OneToMany,
    target_entity: "Member",
    target_table: "member",
    target_key: "member_id",
    join_column: "team_id",
    target_columns: Member::columns,
}];

const MEMBER_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo {
    name: "team",
    kind: AssociationKind::ManyToOne,
    target_entity: "Team",
    target_table: "team",
    target_key: "team_id",
    join_column: "team_id",
    target_columns: Team::columns,
}];

impl Entity for Team {
    const NAME: &'static str = "Team";
    const TABLE: &'static str = "team";
    const PRIMARY_KEY: &'static str = "team_id";
    const ASSOCIATIONS: &'static [AssociationInfo] = TEAM_ASSOCIATIONS;

    fn columns() -> &'static [ColumnDef] {
        TEAM_COLUMNS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64();
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("team_id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row, cx: &mut LoadContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get_named("team_id")?,
            name: row.get_named("name")?,
            members: cx.to_many::<Self, Member>("members", row)?,
        })
    }
}

impl Entity for Member {
    const NAME: &'static str = "Member";
    const TABLE: &'static str = "member";
    const PRIMARY_KEY: &'static str = "member_id";
    const ASSOCIATIONS: &'static [AssociationInfo] = MEMBER_ASSOCIATIONS;

    fn columns() -> &'static [ColumnDef] {
        MEMBER_COLUMNS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64();
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        let mut row = vec![
            ("member_id", self.id.into()),
            ("username", self.username.clone().into()),
            ("age", self.age.into()),
            ("team_id", self.team.foreign_key()),
        ];
        self.audit.write_columns(&mut row);
        row
    }

    fn from_row(row: &Row, cx: &mut LoadContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get_named("member_id")?,
            username: row.get_named("username")?,
            age: row.get_named("age")?,
            team: cx.to_one::<Self, Team>("team", row)?,
            audit: AuditInfo::from_row(row)?,
        })
    }

    fn audit_mut(&mut self) -> Option<&mut AuditInfo> {
        Some(&mut self.audit)
    }
}

/// Entity whose identity is chosen by the caller.
#[derive(Debug)]
pub struct Badge {
    pub code: String,
    pub label: String,
}

impl Entity for Badge {
    const NAME: &'static str = "Badge";
    const TABLE: &'static str = "badge";
    const PRIMARY_KEY: &'static str = "code";
    const ID_GENERATION: IdGeneration = IdGeneration::Assigned;

    fn columns() -> &'static [ColumnDef] {
        const COLUMNS: &[ColumnDef] = &[ColumnDef::insert_only("code"), ColumnDef::new("label")];
        COLUMNS
    }

    fn id(&self) -> Option<Value> {
        (!self.code.is_empty()).then(|| Value::Text(self.code.clone()))
    }

    fn set_id(&mut self, id: Value) {
        if let Value::Text(code) = id {
            self.code = code;
        }
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("code", self.code.clone().into()),
            ("label", self.label.clone().into()),
        ]
    }

    fn from_row(row: &Row, _cx: &mut LoadContext<'_>) -> Result<Self> {
        Ok(Self {
            code: row.get_named("code")?,
            label: row.get_named("label")?,
        })
    }
}

pub fn badge(code: &str, label: &str) -> Badge {
    Badge {
        code: code.to_string(),
        label: label.to_string(),
    }
}

/// A member row as the store would return it.
pub fn member_row(id: i64, username: &str, age: i32, team_id: Option<i64>) -> Row {
    Row::new(
        [
            "member_id",
            "username",
            "age",
            "team_id",
            "created_at",
            "updated_at",
            "created_by",
            "updated_by",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect(),
        vec![
            Value::BigInt(id),
            Value::Text(username.to_string()),
            Value::BigInt(i64::from(age)),
            team_id.into(),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ],
    )
}

pub fn team_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["team_id".to_string(), "name".to_string()],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}

/// A single-column row, e.g. a COUNT result.
pub fn scalar_row(value: Value) -> Row {
    Row::new(vec!["value".to_string()], vec![value])
}

type Responder = Box<dyn Fn(&str, &[Value]) -> Vec<Row> + Send>;

/// Everything the mock store has seen.
#[derive(Default)]
pub struct MockState {
    /// Every statement in execution order, prefixed with its method
    /// (`query:`, `execute:`, `insert:`).
    pub log: Vec<String>,
    pub params: Vec<Vec<Value>>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub next_id: i64,
    /// Rows affected reported by `execute`.
    pub affected: u64,
    /// Statements containing this text fail.
    pub fail_on: Option<String>,
    responder: Option<Responder>,
}

impl MockState {
    pub fn count(&self, prefix: &str) -> usize {
        self.log.iter().filter(|s| s.starts_with(prefix)).count()
    }
}

/// Store double that records statements and answers queries from a
/// closure.
#[derive(Clone, Default)]
pub struct MockStore {
    pub state: Arc<Mutex<MockState>>,
}

impl MockStore {
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut state = store.lock();
            state.next_id = 1;
            state.affected = 1;
        }
        store
    }

    pub fn respond(self, f: impl Fn(&str, &[Value]) -> Vec<Row> + Send + 'static) -> Self {
        self.lock().responder = Some(Box::new(f));
        self
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, method: &str, sql: &str, params: &[Value]) -> Result<()> {
        let mut state = self.lock();
        state.log.push(format!("{method}:{sql}"));
        state.params.push(params.to_vec());
        if state.fail_on.as_deref().is_some_and(|f| sql.contains(f)) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                message: "mock failure".to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

impl Store for MockStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record("query", sql, params)?;
        let state = self.lock();
        Ok(state
            .responder
            .as_ref()
            .map(|f| f(sql, params))
            .unwrap_or_default())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record("execute", sql, params)?;
        Ok(self.lock().affected)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.record("insert", sql, params)?;
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(id)
    }

    fn begin(&self) -> Result<()> {
        self.lock().begins += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.lock().commits += 1;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.lock().rollbacks += 1;
        Ok(())
    }
}
