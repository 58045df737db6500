//! Shared test infrastructure.
//!
//! An in-memory `RelationalStore`, a publish-failure-injecting cache sink,
//! and factories for the domain objects the integration tests keep building.

pub mod factories;
pub mod store;

pub use factories::*;
pub use store::{FlakyCacheSink, MemoryStore};
