//! Bulk statements and their interaction with managed entities.

mod common;

use common::{CountingStore, Member, scalar, seeded_db};
use keel::prelude::*;
use keel::ValidationErrorKind;

fn bulk_age_plus() -> BulkUpdate<Member> {
    BulkUpdate::<Member>::new()
        .set("age", col("age").add(1))
        .filter(col("age").ge(20))
}

#[test]
fn sqlite_bulk_age_plus_leaves_managed_entities_stale() {
    let conn = seeded_db();
    let mut session = Session::begin(&conn).unwrap();

    let member5 = session.find::<Member>(5_i64).unwrap().unwrap();
    assert_eq!(member5.read().age, 40);

    let affected = session.bulk_update(&bulk_age_plus()).unwrap();
    assert_eq!(affected, 3);

    // The managed instance was not refreshed, and re-reading through the
    // session returns the same stale instance.
    assert_eq!(member5.read().age, 40);
    let again = session
        .first(&Query::<Member>::new().filter(col("username").eq("member5")))
        .unwrap()
        .unwrap();
    assert!(EntityRef::ptr_eq(&member5, &again));
    assert_eq!(again.read().age, 40);

    // The database has the new value.
    assert_eq!(scalar(&conn, "SELECT age FROM member WHERE member_id = 5"), 41);

    // Nothing was modified in memory, so commit writes nothing back.
    session.commit().unwrap();
    assert_eq!(scalar(&conn, "SELECT age FROM member WHERE member_id = 5"), 41);
}

#[test]
fn sqlite_bulk_with_clear_reads_fresh_rows() {
    let conn = seeded_db();
    let mut session = Session::begin(&conn).unwrap();

    let stale = session.find::<Member>(5_i64).unwrap().unwrap();
    let affected = session
        .bulk_update_with(&bulk_age_plus(), BulkOptions::clearing())
        .unwrap();
    assert_eq!(affected, 3);

    assert_eq!(stale.state(), EntityState::Detached);
    assert_eq!(session.managed_count(), 0);

    let fresh = session.find::<Member>(5_i64).unwrap().unwrap();
    assert!(!EntityRef::ptr_eq(&stale, &fresh));
    assert_eq!(fresh.read().age, 41);
}

#[test]
fn sqlite_clear_on_bulk_config() {
    let conn = seeded_db();
    let mut session = Session::begin_with(
        &conn,
        SessionConfig::new().clear_on_bulk(true),
        Auditing::default(),
    )
    .unwrap();

    let member = session.find::<Member>(4_i64).unwrap().unwrap();
    session.bulk_update(&bulk_age_plus()).unwrap();
    assert!(!session.contains(&member));
    assert_eq!(session.find::<Member>(4_i64).unwrap().unwrap().read().age, 22);
}

#[test]
fn sqlite_bulk_update_flushes_pending_changes_first() {
    let conn = seeded_db();
    let store = CountingStore::new(&conn);
    let mut session = Session::begin(&store).unwrap();

    // member2 turns 20 in memory; the bulk statement must see it.
    let member2 = session.find::<Member>(2_i64).unwrap().unwrap();
    member2.modify(|m| m.age = 20).unwrap();
    session.persist(Member::new("member7", 30)).unwrap();

    let affected = session.bulk_update(&bulk_age_plus()).unwrap();
    assert_eq!(affected, 5);

    let log = store.log();
    let bulk = log
        .iter()
        .position(|sql| sql.starts_with("UPDATE") && !sql.contains("\"member_id\" ="))
        .unwrap();
    let insert = log.iter().position(|sql| sql.starts_with("INSERT")).unwrap();
    assert!(insert < bulk);
    assert_eq!(scalar(&conn, "SELECT age FROM member WHERE member_id = 2"), 21);
}

#[test]
fn sqlite_bulk_delete() {
    let conn = seeded_db();
    let mut session = Session::begin(&conn).unwrap();

    let affected = session
        .bulk_delete(&BulkDelete::<Member>::all().filter(col("team_id").is_null()))
        .unwrap();
    assert_eq!(affected, 1);
    assert!(session.find::<Member>(6_i64).unwrap().is_none());

    let affected = session
        .bulk_delete(&BulkDelete::<Member>::all().filter(col("age").lt(0)))
        .unwrap();
    assert_eq!(affected, 0);
    session.commit().unwrap();
    assert_eq!(scalar(&conn, "SELECT COUNT(*) FROM member"), 5);
}

#[test]
fn sqlite_bulk_update_rejects_unknown_and_immutable_columns() {
    let conn = seeded_db();
    let mut session = Session::begin(&conn).unwrap();

    let err = session
        .bulk_update(&BulkUpdate::<Member>::new().set("nickname", "x"))
        .unwrap_err();
    assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownProperty));

    let err = session
        .bulk_update(&BulkUpdate::<Member>::new().set("member_id", 1_i64))
        .unwrap_err();
    assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownProperty));

    let err = session.bulk_update(&BulkUpdate::<Member>::new()).unwrap_err();
    assert_eq!(err.validation_kind(), Some(ValidationErrorKind::EmptyMutation));
}
