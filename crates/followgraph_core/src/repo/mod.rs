//! Relationship store abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the durable edge/user storage contract.
//! - Isolate SQLite query details from the graph consistency service.
//!
//! # Invariants
//! - Repository reads always reflect the latest committed (or own
//!   in-transaction) state, never a cached object graph.

pub mod follow_repo;
