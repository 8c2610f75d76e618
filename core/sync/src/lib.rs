//! Mailsync Sync Engine
//!
//! This module provides incremental collection sync for one account, including:
//! - Paged fetching with growing page sizes and request throttling
//! - Metadata prefetch attached to every fetched page
//! - Shared resume timer with multiplicative backoff
//! - Debounced persistence of per-collection progress
//! - Lifecycle coordination with push-update and cache collaborators

pub mod backoff;
pub mod collaborators;
pub mod config;
mod metadata;
mod pagination;
pub mod signal;
pub mod state;
pub mod worker;
pub mod writer;

// Re-export main types
pub use backoff::{BackoffTimer, TimerCallback};
pub use collaborators::{DeltaConnection, RefreshCache};
pub use config::{BackoffConfig, PagePolicy, SyncConfig};
pub use signal::RetryHandle;
pub use state::{CollectionPhase, CollectionState, SyncState, SyncStats};
pub use worker::{Collaborators, CursorHandle, SyncWorker};
pub use writer::StateWriter;
