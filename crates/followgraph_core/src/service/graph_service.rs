//! Graph consistency service.
//!
//! # Responsibility
//! - Provide one-shot follow/unfollow/delete entry points that keep
//!   caller-held user copies honest.
//! - Answer counts straight from the relationship store.
//! - Detect outdated in-memory relation sets on read.
//!
//! # Invariants
//! - A caller-held copy passed as `held` is overwritten only after the
//!   enclosing unit of work committed; on any error it is left untouched.
//! - Copies *not* passed as `held` are never updated. They are detected as
//!   stale by `read_following`/`read_followers`/`verify`, and must be
//!   refreshed with `reload`.
//! - Counts never read an in-memory set, so they never fail as stale.

use crate::model::user::{RelationAccessError, RelationKind, User, UserId};
use crate::repo::follow_repo::{FollowRepository, SqliteFollowRepository, StoreError};
use crate::service::unit_of_work::{check_against_record, Fetch, UnitOfWork};
use log::{debug, warn};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type GraphResult<T> = Result<T, GraphError>;

/// Failure of a graph consistency operation.
#[derive(Debug)]
pub enum GraphError {
    /// Transient store failure; the whole unit of work may be retried.
    StoreUnavailable(StoreError),
    /// Referenced user does not exist. Not retryable.
    InvalidReference(UserId),
    /// A relation set was read while marked stale. Signals a caller bug.
    StaleReadViolation { user_id: UserId, kind: RelationKind },
    /// A relation set was read outside a unit of work before being fetched.
    NotLoaded { user_id: UserId, kind: RelationKind },
    /// A user tried to follow itself.
    SelfFollow(UserId),
    /// A second copy of an already tracked user was attached.
    DuplicateIdentity(UserId),
    /// User name is empty after trimming.
    InvalidName(String),
    /// Any other store failure.
    Store(StoreError),
}

impl GraphError {
    /// Returns whether retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl Display for GraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreUnavailable(err) => write!(f, "{err}"),
            Self::InvalidReference(id) => write!(f, "user does not exist: {id}"),
            Self::StaleReadViolation { user_id, kind } => write!(
                f,
                "stale read of {kind} set for user {user_id}; reload before reading"
            ),
            Self::NotLoaded { user_id, kind } => {
                write!(f, "{kind} set of user {user_id} was never loaded")
            }
            Self::SelfFollow(id) => write!(f, "user {id} cannot follow itself"),
            Self::DuplicateIdentity(id) => {
                write!(f, "user {id} is already tracked by this unit of work")
            }
            Self::InvalidName(name) => write!(f, "invalid user name: `{name}`"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for GraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StoreUnavailable(err) | Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for GraphError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidReference(id) => Self::InvalidReference(id),
            unavailable @ StoreError::Unavailable(_) => Self::StoreUnavailable(unavailable),
            other => Self::Store(other),
        }
    }
}

impl From<rusqlite::Error> for GraphError {
    fn from(value: rusqlite::Error) -> Self {
        Self::from(StoreError::from(value))
    }
}

impl From<RelationAccessError> for GraphError {
    fn from(value: RelationAccessError) -> Self {
        match value {
            RelationAccessError::NotLoaded { user_id, kind } => Self::NotLoaded { user_id, kind },
            RelationAccessError::Stale { user_id, kind } => {
                Self::StaleReadViolation { user_id, kind }
            }
        }
    }
}

/// Service facade over one SQLite connection.
pub struct GraphService<'conn> {
    conn: &'conn mut Connection,
}

impl<'conn> GraphService<'conn> {
    /// Creates a service over a migrated connection.
    pub fn new(conn: &'conn mut Connection) -> Self {
        Self { conn }
    }

    /// Opens a unit of work for multi-step operations.
    pub fn begin(&mut self) -> GraphResult<UnitOfWork<'_>> {
        UnitOfWork::begin(&mut *self.conn)
    }

    /// Creates a user and returns its id.
    pub fn create_user(&mut self, name: &str) -> GraphResult<UserId> {
        let mut uow = self.begin()?;
        let id = uow.create_user(name)?;
        uow.commit()?;
        Ok(id)
    }

    /// Loads a detached copy with both relation sets fetched.
    pub fn load(&mut self, id: UserId) -> GraphResult<User> {
        self.detached(id, Fetch::Eager)
    }

    /// Loads a detached copy without relation sets.
    ///
    /// Reading either set of the result fails with `NotLoaded` until the
    /// copy is reloaded or attached to a unit of work.
    pub fn find(&mut self, id: UserId) -> GraphResult<User> {
        self.detached(id, Fetch::Lazy)
    }

    fn detached(&mut self, id: UserId, fetch: Fetch) -> GraphResult<User> {
        let mut uow = self.begin()?;
        uow.get(id, fetch)?;
        uow.commit()?
            .remove(&id)
            .ok_or(GraphError::InvalidReference(id))
    }

    /// Makes `user_id` follow `target_id` in one unit of work.
    ///
    /// Copies in `held` (any user, at most one copy per id) are brought
    /// along: the follower's `following` and the target's `followers` are
    /// patched if those copies were fresh. Copies of users that no longer
    /// exist are skipped and left as they were. Returns `false` when the
    /// edge already existed.
    pub fn follow(
        &mut self,
        user_id: UserId,
        target_id: UserId,
        held: &mut [&mut User],
    ) -> GraphResult<bool> {
        self.with_held(held, |uow| uow.follow(user_id, target_id))
    }

    /// Removes the edge `user_id -> target_id`, same contract as `follow`.
    pub fn unfollow(
        &mut self,
        user_id: UserId,
        target_id: UserId,
        held: &mut [&mut User],
    ) -> GraphResult<bool> {
        self.with_held(held, |uow| uow.unfollow(user_id, target_id))
    }

    /// Deletes a user and its edges; held neighbours lose the deleted id.
    ///
    /// A held copy of the deleted user itself is left untouched and will
    /// fail `verify` with `InvalidReference` from then on.
    pub fn delete_user(&mut self, id: UserId, held: &mut [&mut User]) -> GraphResult<bool> {
        self.with_held(held, |uow| uow.delete_user(id))
    }

    /// Counts stored edges where `id` follows someone.
    pub fn following_count(&self, id: UserId) -> GraphResult<u64> {
        Ok(SqliteFollowRepository::new(&*self.conn).count_by_follower(id)?)
    }

    /// Counts stored edges where someone follows `id`.
    pub fn follower_count(&self, id: UserId) -> GraphResult<u64> {
        Ok(SqliteFollowRepository::new(&*self.conn).count_by_followee(id)?)
    }

    /// Discards both relation sets of `user` and reloads them from the store.
    pub fn reload(&mut self, user: &mut User) -> GraphResult<()> {
        let id = user.id();
        let mut uow = self.begin()?;
        uow.reload(id)?;
        let fresh = uow
            .commit()?
            .remove(&id)
            .ok_or(GraphError::InvalidReference(id))?;
        *user = fresh;
        Ok(())
    }

    /// Checks `user` against the stored relation versions, marking any
    /// outdated set stale.
    pub fn verify(&self, user: &mut User) -> GraphResult<()> {
        let id = user.id();
        let record = SqliteFollowRepository::new(&*self.conn)
            .find_user(id)?
            .ok_or(GraphError::InvalidReference(id))?;
        for kind in check_against_record(user, &record) {
            warn!("event=stale_copy module=graph status=ok user_id={id} relation={kind}");
        }
        Ok(())
    }

    /// Reads the `following` set of a detached copy after checking it
    /// against the store.
    ///
    /// # Errors
    /// - `StaleReadViolation` when the store moved on since the copy was loaded.
    /// - `NotLoaded` when the copy was fetched lazily.
    pub fn read_following<'u>(&self, user: &'u mut User) -> GraphResult<&'u BTreeSet<UserId>> {
        self.read_checked(user, RelationKind::Following)
    }

    /// Reads the `followers` set of a detached copy. Same rules as `read_following`.
    pub fn read_followers<'u>(&self, user: &'u mut User) -> GraphResult<&'u BTreeSet<UserId>> {
        self.read_checked(user, RelationKind::Followers)
    }

    fn read_checked<'u>(
        &self,
        user: &'u mut User,
        kind: RelationKind,
    ) -> GraphResult<&'u BTreeSet<UserId>> {
        self.verify(user)?;
        let user: &'u User = user;
        user.read_relation(kind).map_err(|err| {
            warn!("event=stale_read module=graph status=error error={err}");
            GraphError::from(err)
        })
    }

    fn with_held<T, F>(&mut self, held: &mut [&mut User], op: F) -> GraphResult<T>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> GraphResult<T>,
    {
        let mut uow = self.begin()?;
        for user in held.iter() {
            let id = user.id();
            match uow.attach((**user).clone()) {
                Ok(_) => {}
                // Deleted users have nothing left to patch; their copies stay as handed in.
                Err(GraphError::InvalidReference(missing)) if missing == id => {
                    debug!("event=held_copy_skipped module=graph status=ok user_id={id}");
                }
                Err(err) => return Err(err),
            }
        }
        let output = op(&mut uow)?;
        let mut committed = uow.commit()?;
        for user in held.iter_mut() {
            if let Some(updated) = committed.remove(&user.id()) {
                **user = updated;
            }
        }
        Ok(output)
    }
}
