//! Graph consistency services.
//!
//! # Responsibility
//! - Mutate the follow graph through the relationship store.
//! - Keep in-memory user copies either in step with the store or visibly
//!   stale.
//!
//! # Invariants
//! - Relation sets are only mutated here, never by callers directly.

pub mod graph_service;
pub mod unit_of_work;
