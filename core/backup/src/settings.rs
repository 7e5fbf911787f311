//! Persisted backup settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use cloudsave_common::Result;

const APP_DIR: &str = "cloudsave";

/// User-tunable backup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Normalized name of the provider to back up to.
    pub active_provider: String,
    /// Whether the scheduler runs periodic backups.
    pub auto_backups_enabled: bool,
    /// Seconds between periodic backups.
    pub backup_interval_seconds: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            active_provider: "gdrive".to_string(),
            auto_backups_enabled: true,
            backup_interval_seconds: 3600,
        }
    }
}

/// Storage for [`BackupSettings`].
pub trait SettingsStore: Send + Sync {
    /// Load the settings, falling back to defaults when none were saved.
    fn load(&self) -> Result<BackupSettings>;

    /// Persist the settings.
    fn save(&self, settings: &BackupSettings) -> Result<()>;
}

/// Default settings file: `<config_dir>/cloudsave/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("settings.json"))
}

/// Default credentials directory: `<data_dir>/cloudsave/tokens`.
pub fn default_tokens_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR).join("tokens"))
}

/// Settings kept in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    /// Create a store backed by `path`. Nothing is read until [`load`](SettingsStore::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<BackupSettings> {
        match fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                Ok(BackupSettings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, settings: &BackupSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(settings)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;

        Ok(())
    }
}

/// In-process settings store.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<BackupSettings>,
    saves: AtomicUsize,
}

impl MemorySettingsStore {
    /// Create a store that loads `settings`.
    pub fn new(settings: BackupSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            saves: AtomicUsize::new(0),
        }
    }

    /// Last saved (or initial) settings.
    pub fn current(&self) -> BackupSettings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of calls to `save`.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<BackupSettings> {
        Ok(self.current())
    }

    fn save(&self, settings: &BackupSettings) -> Result<()> {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Settings shared by the orchestrator and the scheduler.
///
/// Every change is written through to the store.
pub struct SharedSettings {
    current: Mutex<BackupSettings>,
    store: Arc<dyn SettingsStore>,
}

impl SharedSettings {
    /// Load settings from `store`.
    ///
    /// # Errors
    /// - The store exists but cannot be read or parsed
    pub fn load(store: Arc<dyn SettingsStore>) -> Result<Self> {
        let current = store.load()?;
        Ok(Self {
            current: Mutex::new(current),
            store,
        })
    }

    /// Settings backed by a fresh in-memory store.
    pub fn in_memory(settings: BackupSettings) -> Self {
        Self {
            current: Mutex::new(settings.clone()),
            store: Arc::new(MemorySettingsStore::new(settings)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackupSettings> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> BackupSettings {
        self.lock().clone()
    }

    /// Apply `change` and persist the result.
    ///
    /// A failed save is logged; the change still applies in memory.
    pub fn update<F>(&self, change: F) -> BackupSettings
    where
        F: FnOnce(&mut BackupSettings),
    {
        let updated = {
            let mut current = self.lock();
            change(&mut current);
            current.clone()
        };

        if let Err(e) = self.store.save(&updated) {
            warn!("Failed to save settings: {}", e);
        }

        updated
    }
}
