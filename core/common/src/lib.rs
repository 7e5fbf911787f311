//! Common utilities and types shared across CloudSave modules.
//!
//! This module provides the error type and the small value types (provider
//! names, snapshot labels) that every other crate agrees on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ProviderName, SnapshotLabel, ARCHIVE_EXTENSION};
