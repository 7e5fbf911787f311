//! In-memory storage provider for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::fs;

use cloudsave_common::{Error, Result};

use crate::provider::StorageProvider;

/// In-memory storage provider.
///
/// Useful for testing and development. All objects are stored in memory
/// and lost on drop. Signing out drops the session but keeps the objects.
pub struct MemoryProvider {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    authenticated: AtomicBool,
    accepts_credentials: bool,
    fail_transfers: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryProvider {
    /// Create a new empty, unauthenticated provider.
    ///
    /// [`authenticate`](StorageProvider::authenticate) succeeds.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            authenticated: AtomicBool::new(false),
            accepts_credentials: true,
            fail_transfers: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Create a provider that is already authenticated.
    pub fn authenticated() -> Self {
        let provider = Self::new();
        provider.authenticated.store(true, Ordering::SeqCst);
        provider
    }

    /// Seed a stored object.
    pub fn with_object(self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.write_objects().insert(name.into(), data.into());
        self
    }

    /// Make [`authenticate`](StorageProvider::authenticate) report `false`.
    pub fn rejecting_credentials(mut self) -> Self {
        self.accepts_credentials = false;
        self
    }

    /// Make uploads and downloads fail with a network error.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Get a copy of a stored object.
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.read_objects().get(name).cloned()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.read_objects().len()
    }

    /// Number of successful uploads.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    fn read_objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_objects(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_authenticated(&self, operation: &str) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::Authentication(format!(
                "Tried to {} while unauthenticated",
                operation
            )))
        }
    }

    fn ensure_transfers_allowed(&self) -> Result<()> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            Err(Error::Network("Simulated transfer failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn provider_name(&self) -> &str {
        "Memory"
    }

    async fn authenticate(&self) -> Result<bool> {
        self.authenticated
            .store(self.accepts_credentials, Ordering::SeqCst);
        Ok(self.accepts_credentials)
    }

    async fn upload(&self, local_file: &Path, remote_name: &str) -> Result<()> {
        self.ensure_authenticated("upload")?;
        self.ensure_transfers_allowed()?;

        let data = fs::read(local_file).await?;
        self.write_objects().insert(remote_name.to_string(), data);
        self.uploads.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn download(&self, remote_name: &str, local_file: &Path) -> Result<()> {
        self.ensure_authenticated("download")?;
        self.ensure_transfers_allowed()?;

        let data = self
            .object(remote_name)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", remote_name)))?;
        fs::write(local_file, data).await?;

        Ok(())
    }

    async fn delete(&self, remote_name: &str) -> Result<()> {
        self.ensure_authenticated("delete")?;
        self.write_objects().remove(remote_name);
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_authenticated("list files")?;
        Ok(self.read_objects().keys().cloned().collect())
    }

    async fn sign_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}
