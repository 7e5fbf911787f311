//! Storage provider abstraction for CloudSave.
//!
//! This module provides a trait-based interface for the remote locations
//! snapshots are kept in (Google Drive, a local folder, memory) and the
//! registry the host resolves the active provider from.
//!
//! # Design Principles
//! - Flat object namespace: one backup location per provider
//! - Async operations: All I/O operations are async
//! - Providers own their authentication state
//! - Unified error semantics: Consistent error types across providers

pub mod gdrive;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use gdrive::{GDriveConfig, GDriveProvider};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::StorageProvider;
pub use registry::{ProviderRegistration, ProviderRegistry};
