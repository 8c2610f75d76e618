//! Durable store abstraction for Mailsync.
//!
//! This module provides trait-based interfaces for the two things the sync
//! engine writes locally: the per-account progress blob (a JSON key/value
//! store) and the remote objects pulled from each collection.
//!
//! # Design Principles
//! - Backend isolation: No backend-specific logic in the sync engine
//! - Async operations: All I/O operations are async
//! - Whole-value writes: A key is always replaced, never patched

pub mod local;
pub mod memory;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::{state_key, validate_key, ItemStore, KeyValueStore};
