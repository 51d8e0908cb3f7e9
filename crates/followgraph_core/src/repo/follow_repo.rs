//! Relationship store contract and SQLite implementation.
//!
//! # Responsibility
//! - Persist users and directed follow edges.
//! - Answer edge counts and edge sets straight from storage.
//!
//! # Invariants
//! - `insert_edge`/`delete_edge` are idempotent: repeating them is a no-op.
//! - Count and set queries never consult any in-memory cache.
//! - Edges never outlive either endpoint.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::user::UserId;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Relationship store failure.
#[derive(Debug)]
pub enum StoreError {
    /// Store cannot be reached right now; the unit of work may be retried.
    Unavailable(DbError),
    /// Referenced user does not exist.
    InvalidReference(UserId),
    /// Connection schema is not at the version this binary expects.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Persisted data cannot be converted into a valid value.
    InvalidData(String),
    /// Any other SQLite failure.
    Db(DbError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(err) => write!(f, "relationship store unavailable: {err}"),
            Self::InvalidReference(id) => write!(f, "user does not exist: {id}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "relationship store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted graph data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Unavailable(err) | Self::Db(err) => Some(err),
            Self::InvalidReference(_)
            | Self::UninitializedConnection { .. }
            | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        if value.is_unavailable() {
            Self::Unavailable(value)
        } else {
            Self::Db(value)
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::from(DbError::Sqlite(value))
    }
}

/// Stored user row, including both relation versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    /// Bumped on every persisted change to edges where this user follows.
    pub following_version: i64,
    /// Bumped on every persisted change to edges where this user is followed.
    pub followers_version: i64,
}

/// Durable storage of users and follow edges.
pub trait FollowRepository {
    /// Creates a user and returns the store-assigned id.
    fn create_user(&self, name: &str) -> StoreResult<UserId>;
    fn find_user(&self, id: UserId) -> StoreResult<Option<UserRecord>>;
    /// Deletes a user together with every edge touching it.
    /// Returns `false` when the user did not exist.
    fn delete_user(&self, id: UserId) -> StoreResult<bool>;
    /// Inserts edge `(follower_id, followee_id)`.
    /// Returns `false` when the edge already existed.
    fn insert_edge(&self, follower_id: UserId, followee_id: UserId) -> StoreResult<bool>;
    /// Deletes edge `(follower_id, followee_id)`.
    /// Returns `false` when there was no such edge.
    fn delete_edge(&self, follower_id: UserId, followee_id: UserId) -> StoreResult<bool>;
    fn count_by_follower(&self, user_id: UserId) -> StoreResult<u64>;
    fn count_by_followee(&self, user_id: UserId) -> StoreResult<u64>;
    /// Ids the user follows, as currently stored.
    fn following_of(&self, user_id: UserId) -> StoreResult<BTreeSet<UserId>>;
    /// Ids following the user, as currently stored.
    fn followers_of(&self, user_id: UserId) -> StoreResult<BTreeSet<UserId>>;
}

/// SQLite-backed relationship store.
///
/// Borrowing a `Connection` lets the same repository run against a plain
/// connection or inside an open `Transaction` (which derefs to one).
pub struct SqliteFollowRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteFollowRepository<'conn> {
    /// Constructs a repository after checking the connection is migrated.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        let actual_version: u32 =
            conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        let expected_version = latest_version();
        if actual_version != expected_version {
            return Err(StoreError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }
        Ok(Self::new(conn))
    }

    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn user_exists(&self, id: UserId) -> StoreResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1);",
            [id],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn count_where(&self, sql: &str, user_id: UserId) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(sql, [user_id], |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| StoreError::InvalidData(format!("negative edge count `{count}`")))
    }

    fn ids_where(&self, sql: &str, user_id: UserId) -> StoreResult<BTreeSet<UserId>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([user_id])?;
        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next()? {
            ids.insert(row.get::<_, UserId>(0)?);
        }
        Ok(ids)
    }
}

impl FollowRepository for SqliteFollowRepository<'_> {
    fn create_user(&self, name: &str) -> StoreResult<UserId> {
        self.conn
            .execute("INSERT INTO users (name) VALUES (?1);", [name])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn find_user(&self, id: UserId) -> StoreResult<Option<UserRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, following_version, followers_version
                 FROM users
                 WHERE id = ?1;",
                [id],
                |row| {
                    Ok(UserRecord {
                        id: row.get("id")?,
                        name: row.get("name")?,
                        following_version: row.get("following_version")?,
                        followers_version: row.get("followers_version")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn delete_user(&self, id: UserId) -> StoreResult<bool> {
        // Edges go first so the version triggers fire for every neighbour
        // regardless of how the cascade is executed.
        self.conn.execute(
            "DELETE FROM follow_edges WHERE follower_id = ?1 OR followee_id = ?1;",
            [id],
        )?;
        let changed = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1;", [id])?;
        Ok(changed > 0)
    }

    fn insert_edge(&self, follower_id: UserId, followee_id: UserId) -> StoreResult<bool> {
        for id in [follower_id, followee_id] {
            if !self.user_exists(id)? {
                return Err(StoreError::InvalidReference(id));
            }
        }

        let changed = self.conn.execute(
            "INSERT INTO follow_edges (follower_id, followee_id)
             VALUES (?1, ?2)
             ON CONFLICT (follower_id, followee_id) DO NOTHING;",
            params![follower_id, followee_id],
        )?;
        Ok(changed > 0)
    }

    fn delete_edge(&self, follower_id: UserId, followee_id: UserId) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM follow_edges WHERE follower_id = ?1 AND followee_id = ?2;",
            params![follower_id, followee_id],
        )?;
        Ok(changed > 0)
    }

    fn count_by_follower(&self, user_id: UserId) -> StoreResult<u64> {
        self.count_where(
            "SELECT COUNT(*) FROM follow_edges WHERE follower_id = ?1;",
            user_id,
        )
    }

    fn count_by_followee(&self, user_id: UserId) -> StoreResult<u64> {
        self.count_where(
            "SELECT COUNT(*) FROM follow_edges WHERE followee_id = ?1;",
            user_id,
        )
    }

    fn following_of(&self, user_id: UserId) -> StoreResult<BTreeSet<UserId>> {
        self.ids_where(
            "SELECT followee_id FROM follow_edges WHERE follower_id = ?1;",
            user_id,
        )
    }

    fn followers_of(&self, user_id: UserId) -> StoreResult<BTreeSet<UserId>> {
        self.ids_where(
            "SELECT follower_id FROM follow_edges WHERE followee_id = ?1;",
            user_id,
        )
    }
}
