//! Remote collection API for Mailsync.
//!
//! This module provides the trait the sync engine pages collections through,
//! an HTTP implementation, and an in-memory implementation for tests.

pub mod api;
pub mod http;
pub mod mock;

pub use api::{CollectionApi, METADATA_PAGE_SIZE};
pub use http::{ApiConfig, HttpApi};
pub use mock::{Fault, MockApi};
