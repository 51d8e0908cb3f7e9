use followgraph_core::db::open_db_in_memory;
use followgraph_core::{FollowRepository, SqliteFollowRepository, StoreError};
use rusqlite::Connection;
use std::collections::BTreeSet;

#[test]
fn insert_edge_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();

    assert!(repo.insert_edge(a, b).unwrap());
    assert!(!repo.insert_edge(a, b).unwrap());

    assert_eq!(repo.count_by_follower(a).unwrap(), 1);
    assert_eq!(repo.count_by_followee(b).unwrap(), 1);
    assert_eq!(repo.count_by_follower(b).unwrap(), 0);
}

#[test]
fn delete_edge_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();

    assert!(!repo.delete_edge(a, b).unwrap());
    repo.insert_edge(a, b).unwrap();
    assert!(repo.delete_edge(a, b).unwrap());
    assert!(!repo.delete_edge(a, b).unwrap());
    assert_eq!(repo.count_by_follower(a).unwrap(), 0);
}

#[test]
fn insert_edge_to_missing_user_is_invalid_reference() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();

    let err = repo.insert_edge(a, 404).unwrap_err();
    assert!(matches!(err, StoreError::InvalidReference(404)));
    let err = repo.insert_edge(405, a).unwrap_err();
    assert!(matches!(err, StoreError::InvalidReference(405)));
    assert_eq!(repo.count_by_followee(a).unwrap(), 0);
}

#[test]
fn edge_sets_follow_both_directions_of_one_table() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();
    let c = repo.create_user("c").unwrap();

    repo.insert_edge(a, b).unwrap();
    repo.insert_edge(a, c).unwrap();
    repo.insert_edge(c, b).unwrap();

    assert_eq!(repo.following_of(a).unwrap(), BTreeSet::from([b, c]));
    assert_eq!(repo.followers_of(b).unwrap(), BTreeSet::from([a, c]));
    assert_eq!(repo.followers_of(a).unwrap(), BTreeSet::new());
}

#[test]
fn edge_writes_bump_relation_versions_of_both_endpoints() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();

    repo.insert_edge(a, b).unwrap();
    repo.insert_edge(a, b).unwrap();
    let a_record = repo.find_user(a).unwrap().unwrap();
    let b_record = repo.find_user(b).unwrap().unwrap();
    assert_eq!(a_record.following_version, 1);
    assert_eq!(a_record.followers_version, 0);
    assert_eq!(b_record.followers_version, 1);
    assert_eq!(b_record.following_version, 0);

    repo.delete_edge(a, b).unwrap();
    let a_record = repo.find_user(a).unwrap().unwrap();
    assert_eq!(a_record.following_version, 2);
}

#[test]
fn raw_writes_from_another_connection_are_versioned_too() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.sqlite3");
    let first = followgraph_core::db::open_db(&path).unwrap();
    let second = followgraph_core::db::open_db(&path).unwrap();

    let repo = SqliteFollowRepository::try_new(&first).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();

    second
        .execute(
            "INSERT INTO follow_edges (follower_id, followee_id) VALUES (?1, ?2);",
            [a, b],
        )
        .unwrap();

    assert_eq!(repo.find_user(a).unwrap().unwrap().following_version, 1);
    assert_eq!(repo.count_by_follower(a).unwrap(), 1);
}

#[test]
fn delete_user_removes_edges_on_both_sides() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();
    let c = repo.create_user("c").unwrap();
    repo.insert_edge(a, b).unwrap();
    repo.insert_edge(c, b).unwrap();
    repo.insert_edge(b, c).unwrap();

    assert!(repo.delete_user(b).unwrap());
    assert!(!repo.delete_user(b).unwrap());

    assert!(repo.find_user(b).unwrap().is_none());
    assert_eq!(repo.count_by_follower(a).unwrap(), 0);
    assert_eq!(repo.count_by_followee(c).unwrap(), 0);
    assert_eq!(repo.find_user(a).unwrap().unwrap().following_version, 2);
}

#[test]
fn schema_cascade_removes_edges_when_user_row_is_deleted_directly() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();
    let b = repo.create_user("b").unwrap();
    repo.insert_edge(a, b).unwrap();

    conn.execute("DELETE FROM users WHERE id = ?1;", [b]).unwrap();
    assert_eq!(repo.count_by_follower(a).unwrap(), 0);
}

#[test]
fn self_edge_violates_schema_check() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    let a = repo.create_user("a").unwrap();

    let err = repo.insert_edge(a, a).unwrap_err();
    assert!(matches!(err, StoreError::Db(_)));
}

#[test]
fn counts_for_unknown_user_are_zero() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteFollowRepository::try_new(&conn).unwrap();
    assert_eq!(repo.count_by_follower(77).unwrap(), 0);
    assert_eq!(repo.count_by_followee(77).unwrap(), 0);
}

#[test]
fn try_new_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteFollowRepository::try_new(&conn).err().unwrap();
    assert!(matches!(
        err,
        StoreError::UninitializedConnection {
            actual_version: 0,
            ..
        }
    ));
}
