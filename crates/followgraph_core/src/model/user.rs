//! User domain model and in-memory relation sets.
//!
//! # Responsibility
//! - Hold a user's identity and its cached `following`/`followers` sets.
//! - Track per-set load state so outdated reads surface as errors.
//!
//! # Invariants
//! - `followers` is never mutated on its own; it only changes as the
//!   inverse of an edge written through the graph service.
//! - A set in `Stale` or `Unloaded` state never hands out its members.
//! - `version` is the store relation version the members correspond to.
//!   It is meaningless while `Unloaded`.

use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Opaque numeric user identity, assigned by the store.
pub type UserId = i64;

/// Direction of a relation set, seen from its owning user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Users the owner follows (edges where the owner is `follower_id`).
    Following,
    /// Users following the owner (edges where the owner is `followee_id`).
    Followers,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Following => "following",
            Self::Followers => "followers",
        }
    }
}

impl Display for RelationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load state of one in-memory relation set.
///
/// Transitions: `Unloaded -> Loaded -> Stale -> Loaded` (the last one only
/// through an explicit reload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationState {
    /// Never fetched; members are unknown.
    Unloaded,
    /// Fetched fresh or kept in step with every mutation since.
    Loaded,
    /// The store moved on without this copy; must be reloaded before use.
    Stale,
}

/// Failure reading a cached relation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationAccessError {
    /// Set was never fetched and no unit of work is open to fetch it.
    NotLoaded { user_id: UserId, kind: RelationKind },
    /// Set may no longer match the store.
    Stale { user_id: UserId, kind: RelationKind },
}

impl Display for RelationAccessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded { user_id, kind } => {
                write!(f, "{kind} set of user {user_id} is not loaded")
            }
            Self::Stale { user_id, kind } => write!(
                f,
                "{kind} set of user {user_id} is stale; reload before reading"
            ),
        }
    }
}

impl Error for RelationAccessError {}

/// Edit applied to a loaded set after the matching edge write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberChange {
    Insert(UserId),
    Remove(UserId),
}

/// Cached member ids of one relation direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationSet {
    state: RelationState,
    version: i64,
    members: BTreeSet<UserId>,
}

impl RelationSet {
    pub(crate) fn unloaded() -> Self {
        Self {
            state: RelationState::Unloaded,
            version: 0,
            members: BTreeSet::new(),
        }
    }

    pub(crate) fn loaded(members: BTreeSet<UserId>, version: i64) -> Self {
        Self {
            state: RelationState::Loaded,
            version,
            members,
        }
    }

    pub fn state(&self) -> RelationState {
        self.state
    }

    /// Store relation version the cached members were taken at.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_loaded(&self) -> bool {
        self.state == RelationState::Loaded
    }

    pub(crate) fn mark_stale(&mut self) {
        if self.state == RelationState::Loaded {
            self.state = RelationState::Stale;
        }
    }

    /// Patches the set after an edge write moved the stored version from
    /// `expected` to `current`.
    ///
    /// A copy that was not at `expected` already missed another change, so
    /// patching it would hide that; it becomes `Stale` instead. Unloaded
    /// sets stay unloaded and pick up the change on first fetch.
    pub(crate) fn apply(&mut self, change: MemberChange, expected: i64, current: i64) {
        match self.state {
            RelationState::Unloaded | RelationState::Stale => {}
            RelationState::Loaded if self.version != expected => {
                self.state = RelationState::Stale;
            }
            RelationState::Loaded => {
                match change {
                    MemberChange::Insert(id) => {
                        self.members.insert(id);
                    }
                    MemberChange::Remove(id) => {
                        self.members.remove(&id);
                    }
                }
                self.version = current;
            }
        }
    }

    /// Compares the cached version with the stored one, marking the set
    /// stale on mismatch. Returns whether the set is still usable.
    pub(crate) fn check_version(&mut self, stored: i64) -> bool {
        if self.state == RelationState::Loaded && self.version != stored {
            self.state = RelationState::Stale;
        }
        self.state == RelationState::Loaded
    }

    fn read(
        &self,
        user_id: UserId,
        kind: RelationKind,
    ) -> Result<&BTreeSet<UserId>, RelationAccessError> {
        match self.state {
            RelationState::Loaded => Ok(&self.members),
            RelationState::Unloaded => Err(RelationAccessError::NotLoaded { user_id, kind }),
            RelationState::Stale => Err(RelationAccessError::Stale { user_id, kind }),
        }
    }
}

/// In-memory user with its two relation sets.
///
/// Relation sets can only be changed and read through the graph service,
/// so every mutation goes through the store first and every read is
/// checked against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    id: UserId,
    name: String,
    following: RelationSet,
    followers: RelationSet,
}

impl User {
    pub(crate) fn new(
        id: UserId,
        name: impl Into<String>,
        following: RelationSet,
        followers: RelationSet,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            following,
            followers,
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relation(&self, kind: RelationKind) -> &RelationSet {
        match kind {
            RelationKind::Following => &self.following,
            RelationKind::Followers => &self.followers,
        }
    }

    pub(crate) fn relation_mut(&mut self, kind: RelationKind) -> &mut RelationSet {
        match kind {
            RelationKind::Following => &mut self.following,
            RelationKind::Followers => &mut self.followers,
        }
    }

    /// Returns the cached members of one set, judged on local state only.
    ///
    /// A copy outdated by a write made elsewhere still reads as loaded
    /// here, so callers outside the service must go through the
    /// version-checked reads (`GraphService::read_following`,
    /// `UnitOfWork::following`).
    pub(crate) fn read_relation(
        &self,
        kind: RelationKind,
    ) -> Result<&BTreeSet<UserId>, RelationAccessError> {
        self.relation(kind).read(self.id, kind)
    }

    /// Marks both sets stale. Unloaded sets are unaffected.
    pub fn invalidate(&mut self) {
        self.following.mark_stale();
        self.followers.mark_stale();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MemberChange, RelationAccessError, RelationKind, RelationSet, RelationState, User,
    };
    use std::collections::BTreeSet;

    fn loaded_user() -> User {
        User::new(
            1,
            "alice",
            RelationSet::loaded(BTreeSet::from([2]), 3),
            RelationSet::loaded(BTreeSet::new(), 0),
        )
    }

    #[test]
    fn unloaded_set_reports_not_loaded() {
        let user = User::new(7, "lazy", RelationSet::unloaded(), RelationSet::unloaded());
        assert_eq!(
            user.read_relation(RelationKind::Following).unwrap_err(),
            RelationAccessError::NotLoaded {
                user_id: 7,
                kind: RelationKind::Following
            }
        );
    }

    #[test]
    fn apply_at_expected_version_patches_members() {
        let mut set = RelationSet::loaded(BTreeSet::from([2]), 3);
        set.apply(MemberChange::Insert(5), 3, 4);
        assert_eq!(set.state(), RelationState::Loaded);
        assert_eq!(set.version(), 4);

        set.apply(MemberChange::Remove(2), 4, 5);
        let user = User::new(1, "a", set, RelationSet::unloaded());
        assert_eq!(
            user.read_relation(RelationKind::Following).unwrap(),
            &BTreeSet::from([5])
        );
    }

    #[test]
    fn apply_on_outdated_copy_marks_stale_without_patching() {
        let mut set = RelationSet::loaded(BTreeSet::from([2]), 1);
        set.apply(MemberChange::Insert(5), 3, 4);
        assert_eq!(set.state(), RelationState::Stale);
        assert_eq!(set.version(), 1);
    }

    #[test]
    fn check_version_detects_mismatch_once_and_stays_stale() {
        let mut user = loaded_user();
        assert!(user.relation_mut(RelationKind::Following).check_version(3));
        assert!(!user.relation_mut(RelationKind::Following).check_version(4));
        assert!(!user.relation_mut(RelationKind::Following).check_version(3));
        assert!(matches!(
            user.read_relation(RelationKind::Following),
            Err(RelationAccessError::Stale { user_id: 1, .. })
        ));
    }

    #[test]
    fn invalidate_leaves_unloaded_sets_alone() {
        let mut user = User::new(
            1,
            "a",
            RelationSet::loaded(BTreeSet::new(), 0),
            RelationSet::unloaded(),
        );
        user.invalidate();
        assert_eq!(user.relation(RelationKind::Following).state(), RelationState::Stale);
        assert_eq!(
            user.relation(RelationKind::Followers).state(),
            RelationState::Unloaded
        );
    }
}
