//! Unit of work over the relationship store.
//!
//! # Responsibility
//! - Scope store writes in one IMMEDIATE SQLite transaction.
//! - Own the in-memory copies loaded or attached during that scope
//!   (identity map: one copy per user id).
//! - Keep tracked copies in step with every edge write, or mark them stale.
//!
//! # Invariants
//! - Each edge write runs in its own savepoint; tracked copies are patched
//!   only after the savepoint is released, so a failed operation leaves
//!   both the store and the copies as they were.
//! - A tracked set is patched only when it was at the pre-write version.
//! - Dropping a unit of work without `commit` rolls the transaction back.

use crate::model::user::{MemberChange, RelationKind, RelationSet, RelationState, User, UserId};
use crate::repo::follow_repo::{FollowRepository, SqliteFollowRepository, UserRecord};
use crate::service::graph_service::{GraphError, GraphResult};
use log::{debug, info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use uuid::Uuid;

/// How much of a user to fetch when it is first loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fetch {
    /// Load identity and both relation sets.
    #[default]
    Eager,
    /// Load identity only; relation sets stay `Unloaded` until first read.
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeWrite {
    Insert,
    Delete,
}

impl EdgeWrite {
    fn event(self) -> &'static str {
        match self {
            Self::Insert => "graph_follow",
            Self::Delete => "graph_unfollow",
        }
    }
}

/// Atomic scope for graph reads and writes.
pub struct UnitOfWork<'conn> {
    id: Uuid,
    tx: Transaction<'conn>,
    tracked: BTreeMap<UserId, User>,
    attached: Vec<User>,
    started_at: Instant,
}

impl<'conn> UnitOfWork<'conn> {
    pub(crate) fn begin(conn: &'conn mut Connection) -> GraphResult<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = Uuid::new_v4();
        debug!("event=uow_begin module=graph status=ok uow_id={id}");
        Ok(Self {
            id,
            tx,
            tracked: BTreeMap::new(),
            attached: Vec::new(),
            started_at: Instant::now(),
        })
    }

    /// Correlation id used in log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the tracked copy of `id`, if any.
    pub fn user(&self, id: UserId) -> Option<&User> {
        self.tracked.get(&id)
    }

    /// Iterates tracked copies in id order.
    pub fn tracked(&self) -> impl Iterator<Item = &User> {
        self.tracked.values()
    }

    fn repo(&self) -> SqliteFollowRepository<'_> {
        SqliteFollowRepository::new(&self.tx)
    }

    /// Creates a user. The new user is not tracked until loaded.
    pub fn create_user(&mut self, name: &str) -> GraphResult<UserId> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(GraphError::InvalidName(name.to_string()));
        }
        let id = self.repo().create_user(trimmed)?;
        debug!("event=user_create module=graph status=ok uow_id={} user_id={id}", self.id);
        Ok(id)
    }

    /// Returns the tracked copy of `id`, loading it from the store first if
    /// it is not tracked yet.
    ///
    /// With `Fetch::Eager`, unloaded sets of an already tracked copy are
    /// initialized as well.
    ///
    /// # Errors
    /// - `InvalidReference` when the user does not exist.
    pub fn get(&mut self, id: UserId, fetch: Fetch) -> GraphResult<&User> {
        if !self.tracked.contains_key(&id) {
            let user = self.load_from_store(id, fetch)?;
            self.tracked.insert(id, user);
        } else if fetch == Fetch::Eager {
            self.initialize(id, RelationKind::Following)?;
            self.initialize(id, RelationKind::Followers)?;
        }
        self.tracked.get(&id).ok_or(GraphError::InvalidReference(id))
    }

    /// Brings a copy loaded elsewhere into this unit of work.
    ///
    /// The copy is checked against the stored relation versions; sets that
    /// fell behind are marked `Stale` and must be reloaded before reading.
    /// The copy as handed in is kept so `rollback` can return it.
    ///
    /// # Errors
    /// - `DuplicateIdentity` when a copy of the same user is already tracked.
    /// - `InvalidReference` when the user no longer exists.
    pub fn attach(&mut self, user: User) -> GraphResult<&User> {
        let id = user.id();
        if self.tracked.contains_key(&id) {
            return Err(GraphError::DuplicateIdentity(id));
        }
        let record = self
            .repo()
            .find_user(id)?
            .ok_or(GraphError::InvalidReference(id))?;

        self.attached.push(user.clone());
        let mut user = user;
        for kind in check_against_record(&mut user, &record) {
            warn!(
                "event=stale_copy module=graph status=ok uow_id={} user_id={id} relation={kind}",
                self.id
            );
        }
        self.tracked.insert(id, user);
        self.tracked.get(&id).ok_or(GraphError::InvalidReference(id))
    }

    /// Records that `user_id` follows `target_id`.
    ///
    /// Tracked copies of both users are patched; a repeated follow is a
    /// no-op and returns `false`.
    ///
    /// # Errors
    /// - `SelfFollow` when both ids are equal.
    /// - `InvalidReference` when either user does not exist.
    pub fn follow(&mut self, user_id: UserId, target_id: UserId) -> GraphResult<bool> {
        if user_id == target_id {
            return Err(GraphError::SelfFollow(user_id));
        }
        self.write_edge(user_id, target_id, EdgeWrite::Insert)
    }

    /// Removes the edge `user_id -> target_id`. Missing edges are a no-op
    /// returning `false`; missing users are `InvalidReference`.
    pub fn unfollow(&mut self, user_id: UserId, target_id: UserId) -> GraphResult<bool> {
        self.write_edge(user_id, target_id, EdgeWrite::Delete)
    }

    fn write_edge(
        &mut self,
        follower_id: UserId,
        followee_id: UserId,
        write: EdgeWrite,
    ) -> GraphResult<bool> {
        let sp = self.tx.savepoint()?;
        let (changed, before, after) = {
            let repo = SqliteFollowRepository::new(&sp);
            let before = endpoint_versions(&repo, follower_id, followee_id)?;
            let changed = match write {
                EdgeWrite::Insert => repo.insert_edge(follower_id, followee_id)?,
                EdgeWrite::Delete => repo.delete_edge(follower_id, followee_id)?,
            };
            let after = if changed {
                endpoint_versions(&repo, follower_id, followee_id)?
            } else {
                before
            };
            (changed, before, after)
        };
        sp.commit()?;

        if changed {
            let (to_followee, to_follower) = match write {
                EdgeWrite::Insert => (
                    MemberChange::Insert(followee_id),
                    MemberChange::Insert(follower_id),
                ),
                EdgeWrite::Delete => (
                    MemberChange::Remove(followee_id),
                    MemberChange::Remove(follower_id),
                ),
            };
            self.patch(follower_id, RelationKind::Following, to_followee, before.0, after.0);
            self.patch(followee_id, RelationKind::Followers, to_follower, before.1, after.1);
        }

        info!(
            "event={} module=graph status=ok uow_id={} user_id={follower_id} target_id={followee_id} changed={changed}",
            write.event(),
            self.id
        );
        Ok(changed)
    }

    /// Deletes a user and every edge touching it.
    ///
    /// Tracked neighbours lose the deleted id from their sets; the deleted
    /// user's own tracked copy is dropped. Returns `false` when the user did
    /// not exist.
    pub fn delete_user(&mut self, id: UserId) -> GraphResult<bool> {
        let sp = self.tx.savepoint()?;
        let patches = {
            let repo = SqliteFollowRepository::new(&sp);
            if repo.find_user(id)?.is_none() {
                return Ok(false);
            }
            let followed = repo.following_of(id)?;
            let following_me = repo.followers_of(id)?;
            let neighbours: BTreeSet<UserId> =
                followed.union(&following_me).copied().collect();

            let before = neighbour_records(&repo, &neighbours)?;
            repo.delete_user(id)?;
            let after = neighbour_records(&repo, &neighbours)?;

            let mut patches = Vec::new();
            for neighbour in &followed {
                if let (Some(old), Some(new)) = (before.get(neighbour), after.get(neighbour)) {
                    patches.push((
                        *neighbour,
                        RelationKind::Followers,
                        old.followers_version,
                        new.followers_version,
                    ));
                }
            }
            for neighbour in &following_me {
                if let (Some(old), Some(new)) = (before.get(neighbour), after.get(neighbour)) {
                    patches.push((
                        *neighbour,
                        RelationKind::Following,
                        old.following_version,
                        new.following_version,
                    ));
                }
            }
            patches
        };
        sp.commit()?;

        for (neighbour, kind, expected, current) in patches {
            self.patch(neighbour, kind, MemberChange::Remove(id), expected, current);
        }
        self.tracked.remove(&id);
        info!(
            "event=user_delete module=graph status=ok uow_id={} user_id={id}",
            self.id
        );
        Ok(true)
    }

    /// Counts stored edges where `id` is the follower.
    pub fn following_count(&self, id: UserId) -> GraphResult<u64> {
        Ok(self.repo().count_by_follower(id)?)
    }

    /// Counts stored edges where `id` is the followee.
    pub fn follower_count(&self, id: UserId) -> GraphResult<u64> {
        Ok(self.repo().count_by_followee(id)?)
    }

    /// Reads the tracked `following` set of `id`, loading the user or the
    /// set on demand.
    ///
    /// # Errors
    /// - `StaleReadViolation` when the tracked set is stale.
    pub fn following(&mut self, id: UserId) -> GraphResult<&BTreeSet<UserId>> {
        self.read(id, RelationKind::Following)
    }

    /// Reads the tracked `followers` set of `id`. Same rules as `following`.
    pub fn followers(&mut self, id: UserId) -> GraphResult<&BTreeSet<UserId>> {
        self.read(id, RelationKind::Followers)
    }

    fn read(&mut self, id: UserId, kind: RelationKind) -> GraphResult<&BTreeSet<UserId>> {
        if !self.tracked.contains_key(&id) {
            let user = self.load_from_store(id, Fetch::Lazy)?;
            self.tracked.insert(id, user);
        }
        self.initialize(id, kind)?;

        let uow_id = self.id;
        let user = self
            .tracked
            .get(&id)
            .ok_or(GraphError::InvalidReference(id))?;
        user.read_relation(kind).map_err(|err| {
            warn!("event=stale_read module=graph status=error uow_id={uow_id} error={err}");
            GraphError::from(err)
        })
    }

    /// Replaces the tracked copy of `id` with one loaded fresh from the store.
    ///
    /// This is the only way to make a stale tracked copy readable again.
    pub fn reload(&mut self, id: UserId) -> GraphResult<&User> {
        let user = self.load_from_store(id, Fetch::Eager)?;
        self.tracked.insert(id, user);
        debug!(
            "event=graph_reload module=graph status=ok uow_id={} user_id={id}",
            self.id
        );
        self.tracked.get(&id).ok_or(GraphError::InvalidReference(id))
    }

    /// Commits store writes and hands back every tracked copy.
    ///
    /// On error the transaction is rolled back and tracked copies are dropped.
    pub fn commit(self) -> GraphResult<BTreeMap<UserId, User>> {
        let Self {
            id,
            tx,
            tracked,
            started_at,
            ..
        } = self;

        if let Err(err) = tx.commit() {
            warn!(
                "event=uow_commit module=graph status=error uow_id={id} duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            );
            return Err(err.into());
        }
        debug!(
            "event=uow_commit module=graph status=ok uow_id={id} duration_ms={} tracked={}",
            started_at.elapsed().as_millis(),
            tracked.len()
        );
        Ok(tracked)
    }

    /// Rolls back store writes and returns the attached copies exactly as
    /// they were handed in.
    pub fn rollback(self) -> Vec<User> {
        let Self {
            id,
            tx,
            attached,
            started_at,
            ..
        } = self;

        match tx.rollback() {
            Ok(()) => debug!(
                "event=uow_rollback module=graph status=ok uow_id={id} duration_ms={}",
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=uow_rollback module=graph status=error uow_id={id} error={err}"
            ),
        }
        attached
    }

    fn load_from_store(&self, id: UserId, fetch: Fetch) -> GraphResult<User> {
        let repo = self.repo();
        let record = repo.find_user(id)?.ok_or(GraphError::InvalidReference(id))?;
        let (following, followers) = match fetch {
            Fetch::Eager => (
                RelationSet::loaded(repo.following_of(id)?, record.following_version),
                RelationSet::loaded(repo.followers_of(id)?, record.followers_version),
            ),
            Fetch::Lazy => (RelationSet::unloaded(), RelationSet::unloaded()),
        };
        Ok(User::new(record.id, record.name, following, followers))
    }

    fn initialize(&mut self, id: UserId, kind: RelationKind) -> GraphResult<()> {
        let unloaded = self
            .tracked
            .get(&id)
            .is_some_and(|user| user.relation(kind).state() == RelationState::Unloaded);
        if !unloaded {
            return Ok(());
        }

        let fresh = {
            let repo = self.repo();
            let record = repo.find_user(id)?.ok_or(GraphError::InvalidReference(id))?;
            match kind {
                RelationKind::Following => {
                    RelationSet::loaded(repo.following_of(id)?, record.following_version)
                }
                RelationKind::Followers => {
                    RelationSet::loaded(repo.followers_of(id)?, record.followers_version)
                }
            }
        };
        if let Some(user) = self.tracked.get_mut(&id) {
            *user.relation_mut(kind) = fresh;
        }
        Ok(())
    }

    fn patch(
        &mut self,
        id: UserId,
        kind: RelationKind,
        change: MemberChange,
        expected: i64,
        current: i64,
    ) {
        let Some(user) = self.tracked.get_mut(&id) else {
            return;
        };
        let set = user.relation_mut(kind);
        let was_loaded = set.is_loaded();
        set.apply(change, expected, current);
        if was_loaded && !set.is_loaded() {
            warn!(
                "event=stale_copy module=graph status=ok uow_id={} user_id={id} relation={kind}",
                self.id
            );
        }
    }
}

/// Checks both sets of `user` against a stored record, marking outdated
/// sets stale. Returns the kinds that went stale in this call.
pub(crate) fn check_against_record(user: &mut User, record: &UserRecord) -> Vec<RelationKind> {
    let mut went_stale = Vec::new();
    for (kind, stored) in [
        (RelationKind::Following, record.following_version),
        (RelationKind::Followers, record.followers_version),
    ] {
        let set = user.relation_mut(kind);
        let was_loaded = set.is_loaded();
        if !set.check_version(stored) && was_loaded {
            went_stale.push(kind);
        }
    }
    went_stale
}

fn endpoint_versions<R: FollowRepository>(
    repo: &R,
    follower_id: UserId,
    followee_id: UserId,
) -> GraphResult<(i64, i64)> {
    let follower = repo
        .find_user(follower_id)?
        .ok_or(GraphError::InvalidReference(follower_id))?;
    let followee = repo
        .find_user(followee_id)?
        .ok_or(GraphError::InvalidReference(followee_id))?;
    Ok((follower.following_version, followee.followers_version))
}

fn neighbour_records<R: FollowRepository>(
    repo: &R,
    ids: &BTreeSet<UserId>,
) -> GraphResult<BTreeMap<UserId, UserRecord>> {
    let mut records = BTreeMap::new();
    for &id in ids {
        if let Some(record) = repo.find_user(id)? {
            records.insert(id, record);
        }
    }
    Ok(records)
}
