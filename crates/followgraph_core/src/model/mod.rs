//! Domain model for users and their follow relations.
//!
//! # Responsibility
//! - Define the in-memory shape of a user and its cached relation sets.
//!
//! # Invariants
//! - `following` and `followers` are two views of one stored edge table.
//! - Cached sets carry their own freshness state; see `RelationState`.

pub mod user;
