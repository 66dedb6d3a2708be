//! # pairwise-core
//!
//! Core types, traits, and abstractions for the pairwise job orchestration
//! and similarity-dedup pipeline.
//!
//! This crate provides the foundational data structures and the ports
//! (repository, matcher, catalog, artifact and workflow traits) that the
//! other pairwise crates depend on. It performs no I/O of its own.

pub mod context;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod pair_key;
pub mod payload;
pub mod traits;

// Re-export commonly used types at crate root
pub use context::RequestContext;
pub use error::{Error, Result};
pub use events::{DomainEvent, EventBus, Outbox};
pub use models::*;
pub use pair_key::{pair_key, split_pair_key};
pub use payload::{promote_payload, SimilarityMatchPayload, TaskPayload, SIMILARITY_MATCH};
pub use traits::*;
