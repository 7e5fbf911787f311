//! CloudSave backup engine
//!
//! This module provides periodic backups of a live directory, including:
//! - Archiving and transfer through the active storage provider
//! - A serialized execution context all directory access runs on
//! - Fixed-rate and manual scheduling
//! - Bounded retries for provider transfers
//! - Persisted settings
//! - Host lifecycle and provider plugin discovery

pub mod executor;
pub mod host;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod settings;

// Re-export main types
pub use executor::{ExecutionContext, Job, SerialExecutor};
pub use host::{build_registry, register_plugins, BuiltinProviders, LifecycleHandler, ProviderPlugin};
pub use orchestrator::BackupOrchestrator;
pub use retry::RetryPolicy;
pub use scheduler::{BackupScheduler, BackupTarget};
pub use settings::{
    default_settings_path, default_tokens_dir, BackupSettings, JsonSettingsStore,
    MemorySettingsStore, SettingsStore, SharedSettings,
};
