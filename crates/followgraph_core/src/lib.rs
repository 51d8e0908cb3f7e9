//! Core logic for the follow graph.
//! This crate owns the consistency contract between cached relation sets
//! and the relationship store.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{CoreConfig, StoreOptions};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::user::{
    RelationAccessError, RelationKind, RelationSet, RelationState, User, UserId,
};
pub use repo::follow_repo::{
    FollowRepository, SqliteFollowRepository, StoreError, StoreResult, UserRecord,
};
pub use service::graph_service::{GraphError, GraphResult, GraphService};
pub use service::unit_of_work::{Fetch, UnitOfWork};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
