//! Shared entities, schema and store helpers for the SQLite integration
//! tests.

#![allow(dead_code)]

use keel::prelude::*;
use keel::{Dialect, SqliteConfig};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub members: ToMany<Member>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            members: ToMany::default(),
        }
    }
}

#[derive(Debug)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: ToOne<Team>,
    pub audit: AuditInfo,
}

impl Member {
    pub fn new(username: &str, age: i32) -> Self {
        Self {
            id: None,
            username: username.to_string(),
            age,
            team: ToOne::none(),
            audit: AuditInfo::default(),
        }
    }

    pub fn in_team(mut self, team: &EntityRef<Team>) -> Self {
        self.team = ToOne::to(team);
        self
    }
}

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
        const COLUMNS: &[ColumnDef] = &[ColumnDef::generated_id("team_id"), ColumnDef::new("name")];
        COLUMNS
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
        const COLUMNS: &[ColumnDef] = &[
            ColumnDef::generated_id("member_id"),
            ColumnDef::new("username"),
            ColumnDef::new("age"),
            ColumnDef::new("team_id"),
            AuditInfo::CREATED_AT,
            AuditInfo::UPDATED_AT,
            AuditInfo::CREATED_BY,
            AuditInfo::UPDATED_BY,
        ];
        COLUMNS
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

/// Entity keyed by a caller-chosen code.
#[derive(Debug)]
pub struct Badge {
    pub code: String,
    pub label: String,
}

impl Badge {
    pub fn new(code: &str, label: &str) -> Self {
        Self {
            code: code.to_string(),
            label: label.to_string(),
        }
    }
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

pub const SCHEMA: &str = "
    CREATE TABLE team (
        team_id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    );
    CREATE TABLE member (
        member_id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        age INTEGER NOT NULL,
        team_id INTEGER REFERENCES team(team_id),
        created_at INTEGER,
        updated_at INTEGER,
        created_by TEXT,
        updated_by TEXT
    );
    CREATE TABLE badge (
        code TEXT PRIMARY KEY,
        label TEXT NOT NULL
    );
";

/// Two teams and six members:
///
/// | id | username | age | team  |
/// |----|----------|-----|-------|
/// | 1  | member1  | 10  | teamA |
/// | 2  | member2  | 19  | teamA |
/// | 3  | member3  | 20  | teamB |
/// | 4  | member4  | 21  | teamB |
/// | 5  | member5  | 40  | teamB |
/// | 6  | member6  | 10  | none  |
pub const SEED: &str = "
    INSERT INTO team (name) VALUES ('teamA'), ('teamB');
    INSERT INTO member (username, age, team_id) VALUES
        ('member1', 10, 1),
        ('member2', 19, 1),
        ('member3', 20, 2),
        ('member4', 21, 2),
        ('member5', 40, 2),
        ('member6', 10, NULL);
";

pub fn empty_db() -> SqliteConnection {
    let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
    conn.execute_raw(SCHEMA).expect("create schema");
    conn
}

pub fn seeded_db() -> SqliteConnection {
    let conn = empty_db();
    conn.execute_raw(SEED).expect("seed rows");
    conn
}

/// A seeded database without foreign key enforcement, so rows can be
/// deleted out from under references to them.
pub fn seeded_db_without_foreign_keys() -> SqliteConnection {
    let conn = SqliteConnection::open(&SqliteConfig::memory().foreign_keys(false))
        .expect("open sqlite memory db");
    conn.execute_raw(SCHEMA).expect("create schema");
    conn.execute_raw(SEED).expect("seed rows");
    conn
}

/// A single integer read straight from the database, outside any session.
pub fn scalar(conn: &SqliteConnection, sql: &str) -> i64 {
    let rows = conn.query(sql, &[]).expect("scalar query");
    rows[0].get_as::<i64>(0).expect("integer column")
}

/// Store wrapper that counts and records the statements it forwards.
pub struct CountingStore<'a> {
    inner: &'a SqliteConnection,
    queries: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl<'a> CountingStore<'a> {
    pub fn new(inner: &'a SqliteConnection) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Number of `query` calls so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of forwarded statements starting with `keyword`.
    pub fn statements(&self, keyword: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|sql| sql.starts_with(keyword))
            .count()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, sql: &str) {
        self.log.lock().unwrap().push(sql.to_string());
    }
}

impl Store for CountingStore<'_> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.record(sql);
        self.inner.query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql);
        self.inner.execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.record(sql);
        self.inner.insert(sql, params)
    }

    fn begin(&self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }
}
