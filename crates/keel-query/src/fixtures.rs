//! Member/Team mappings shared by the unit tests.

use keel_core::{
    AssociationInfo, AssociationKind, ColumnDef, Entity, LoadContext, Result, Row, ToMany, ToOne,
    Value,
};

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
}

const TEAM_COLUMNS: &[ColumnDef] = &[ColumnDef::generated_id("team_id"), ColumnDef::new("name")];

const MEMBER_COLUMNS: &[ColumnDef] = &[
    ColumnDef::generated_id("member_id"),
    ColumnDef::new("username"),
    ColumnDef::new("age"),
    ColumnDef::new("team_id"),
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
        vec![
            ("member_id", self.id.into()),
            ("username", self.username.clone().into()),
            ("age", self.age.into()),
            ("team_id", self.team.foreign_key()),
        ]
    }

    fn from_row(row: &Row, cx: &mut LoadContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get_named("member_id")?,
            username: row.get_named("username")?,
            age: row.get_named("age")?,
            team: cx.to_one::<Self, Team>("team", row)?,
        })
    }
}
