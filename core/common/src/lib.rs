//! Common utilities and types shared across Mailsync modules.
//!
//! This module provides the error type and the domain vocabulary (accounts,
//! collections, page ranges, remote models and metadata) used by the store,
//! API and sync crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Account, AccountId, Collection, MetadataIndex, MetadataRecord, Model, OrganizationUnit,
    PageRange,
};
