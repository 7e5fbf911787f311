//! Backup orchestration against the active storage provider.
//!
//! Snapshot operations are meant to run unattended: every failure is logged
//! with the operation, label and provider and then swallowed, so a broken
//! backend can never take the host down.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::task;
use tracing::{debug, error, info, warn};

use cloudsave_archive::{ArtifactKind, Archiver};
use cloudsave_common::{Error, ProviderName, Result, SnapshotLabel};
use cloudsave_storage::{ProviderRegistry, StorageProvider};

use crate::retry::RetryPolicy;
use crate::settings::SharedSettings;

#[derive(Clone)]
struct ActiveProvider {
    name: ProviderName,
    provider: Arc<dyn StorageProvider>,
}

/// Drives snapshot creation and transfer through the active provider.
pub struct BackupOrchestrator {
    registry: Arc<ProviderRegistry>,
    settings: Arc<SharedSettings>,
    archiver: Archiver,
    retry: RetryPolicy,
    active: RwLock<Option<ActiveProvider>>,
}

impl BackupOrchestrator {
    /// Create an orchestrator with no active provider.
    ///
    /// Call [`restore_active_provider`](Self::restore_active_provider) to
    /// re-select the persisted choice.
    pub fn new(registry: Arc<ProviderRegistry>, settings: Arc<SharedSettings>) -> Self {
        if !registry.is_locked() {
            debug!("Orchestrator created over an unlocked provider registry");
        }

        Self {
            registry,
            settings,
            archiver: Archiver::new(),
            retry: RetryPolicy::default(),
            active: RwLock::new(None),
        }
    }

    /// Use `archiver` for packing and unpacking.
    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = archiver;
        self
    }

    /// Retry transient transfer failures according to `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        debug!(
            "Transfers retry up to {} times, waiting at most {:?}",
            policy.max_retries(),
            policy.worst_case_wait()
        );
        self.retry = policy;
        self
    }

    /// The provider registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The shared settings.
    pub fn settings(&self) -> &Arc<SharedSettings> {
        &self.settings
    }

    fn active(&self) -> Option<ActiveProvider> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The active provider, if one is selected.
    pub fn active_provider(&self) -> Option<Arc<dyn StorageProvider>> {
        self.active().map(|a| a.provider)
    }

    /// Normalized name of the active provider.
    pub fn active_provider_name(&self) -> Option<String> {
        self.active().map(|a| a.name.to_string())
    }

    /// Select the persisted provider if it is registered.
    ///
    /// Returns whether a provider is now active.
    pub fn restore_active_provider(&self) -> bool {
        let persisted = self.settings.snapshot().active_provider;

        match self.set_active(&persisted) {
            Ok(name) => {
                info!("Restored storage provider '{}'", name);
                true
            }
            Err(e) => {
                warn!("Could not restore storage provider: {}", e);
                false
            }
        }
    }

    /// Select `name` as the active provider and persist the choice.
    ///
    /// # Errors
    /// - `UnknownProvider` listing every registered name
    pub fn set_active_provider(&self, name: &str) -> Result<()> {
        let normalized = self.set_active(name)?;
        self.settings
            .update(|s| s.active_provider = normalized.to_string());
        info!("Storage provider set to '{}'", normalized);
        Ok(())
    }

    fn set_active(&self, name: &str) -> Result<ProviderName> {
        let registration = self
            .registry
            .registration(name)
            .ok_or_else(|| Error::UnknownProvider {
                name: name.to_string(),
                available: self.available_provider_names(),
            })?;

        let active = ActiveProvider {
            name: registration.name().clone(),
            provider: registration.provider().clone(),
        };
        let normalized = active.name.clone();
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(active);

        Ok(normalized)
    }

    /// Registered provider names in order.
    pub fn available_provider_names(&self) -> Vec<String> {
        self.registry.all_names().into_iter().collect()
    }

    /// Authenticate the active provider if it has no session yet.
    ///
    /// Returns whether the provider is ready for transfers.
    pub async fn connect_active_provider(&self) -> bool {
        let Some(active) = self.active() else {
            warn!("No storage provider selected");
            return false;
        };
        if active.provider.is_authenticated() {
            return true;
        }

        match active.provider.authenticate().await {
            Ok(true) => {
                info!(provider = %active.name, "Connected to {}", active.provider.provider_name());
                true
            }
            Ok(false) => {
                warn!(provider = %active.name, "{} has no usable credentials", active.provider.provider_name());
                false
            }
            Err(e) => {
                error!(provider = %active.name, "Failed to authenticate with {}: {}", active.provider.provider_name(), e);
                false
            }
        }
    }

    /// The active provider if it can take transfers right now.
    fn ready_provider(&self, operation: &str) -> Option<ActiveProvider> {
        let Some(active) = self.active() else {
            warn!(operation, "No storage provider selected; skipping");
            return None;
        };

        if !active.provider.is_authenticated() {
            warn!(
                operation,
                provider = %active.name,
                "Not signed in to {}; skipping",
                active.provider.provider_name()
            );
            return None;
        }

        Some(active)
    }

    /// Pack `source_dir` and upload it as `<label>.zip`.
    ///
    /// The local artifact is removed whether or not the upload succeeded.
    /// Returns whether the snapshot reached the provider; failures are
    /// logged, never returned.
    pub async fn upload_snapshot(&self, source_dir: &Path, label: &SnapshotLabel) -> bool {
        let Some(active) = self.ready_provider("upload") else {
            return false;
        };

        let artifact = match self.pack(source_dir, label).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(operation = "upload", label = %label, provider = %active.name, "Failed to archive {}: {}", source_dir.display(), e);
                return false;
            }
        };

        let remote_name = label.remote_name();
        let result = self
            .retry
            .run("upload", &remote_name, || active.provider.upload(&artifact, &remote_name))
            .await;

        remove_artifact(&artifact).await;

        match result {
            Ok(()) => {
                info!(label = %label, provider = %active.name, "Uploaded snapshot to {}", active.provider.provider_name());
                true
            }
            Err(e) => {
                error!(operation = "upload", label = %label, provider = %active.name, "Upload failed: {}", e);
                false
            }
        }
    }

    /// Download `<label>.zip` and unpack it into `target_dir`.
    ///
    /// A missing remote snapshot is a logged no-op. Returns whether the
    /// snapshot was restored.
    pub async fn download_snapshot(&self, label: &SnapshotLabel, target_dir: &Path) -> bool {
        let Some(active) = self.ready_provider("download") else {
            return false;
        };

        let artifact = match self.archiver.create_artifact(label, ArtifactKind::Download) {
            Ok((path, file)) => {
                drop(file);
                path
            }
            Err(e) => {
                error!(operation = "download", label = %label, provider = %active.name, "Failed to create download file: {}", e);
                return false;
            }
        };

        let remote_name = label.remote_name();
        let result = match self
            .retry
            .run("download", &remote_name, || active.provider.download(&remote_name, &artifact))
            .await
        {
            Ok(()) => self.unpack(&artifact, target_dir).await,
            Err(e) => Err(e),
        };

        remove_artifact(&artifact).await;

        match result {
            Ok(entries) => {
                info!(label = %label, provider = %active.name, "Restored {} files into {}", entries, target_dir.display());
                true
            }
            Err(e) if e.is_not_found() => {
                warn!(label = %label, provider = %active.name, "No snapshot named {} on {}", remote_name, active.provider.provider_name());
                false
            }
            Err(e) => {
                error!(operation = "download", label = %label, provider = %active.name, "Download failed: {}", e);
                false
            }
        }
    }

    /// Labels of every snapshot stored with the active provider.
    ///
    /// Empty when no provider is ready or listing fails.
    pub async fn list_remote_snapshots(&self) -> Vec<SnapshotLabel> {
        let Some(active) = self.ready_provider("list") else {
            return Vec::new();
        };

        match active.provider.list_files().await {
            Ok(names) => names
                .iter()
                .filter_map(|name| SnapshotLabel::from_remote_name(name))
                .collect(),
            Err(e) => {
                error!(operation = "list", provider = %active.name, "Failed to list snapshots: {}", e);
                Vec::new()
            }
        }
    }

    /// Delete `<label>.zip` from the active provider.
    ///
    /// Returns whether the delete went through.
    pub async fn delete_snapshot(&self, label: &SnapshotLabel) -> bool {
        let Some(active) = self.ready_provider("delete") else {
            return false;
        };

        match active.provider.delete(&label.remote_name()).await {
            Ok(()) => {
                info!(label = %label, provider = %active.name, "Deleted snapshot");
                true
            }
            Err(e) => {
                error!(operation = "delete", label = %label, provider = %active.name, "Delete failed: {}", e);
                false
            }
        }
    }

    async fn pack(&self, source_dir: &Path, label: &SnapshotLabel) -> Result<PathBuf> {
        let archiver = self.archiver.clone();
        let source_dir = source_dir.to_path_buf();
        let label = label.clone();

        task::spawn_blocking(move || archiver.pack(&source_dir, &label))
            .await
            .map_err(|e| Error::Archive(format!("Archive task failed: {}", e)))?
    }

    async fn unpack(&self, artifact: &Path, target_dir: &Path) -> Result<usize> {
        let archiver = self.archiver.clone();
        let artifact = artifact.to_path_buf();
        let target_dir = target_dir.to_path_buf();

        task::spawn_blocking(move || archiver.unpack(&artifact, &target_dir))
            .await
            .map_err(|e| Error::Archive(format!("Extract task failed: {}", e)))?
    }
}

async fn remove_artifact(artifact: &Path) {
    if let Err(e) = tokio::fs::remove_file(artifact).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete temporary file {}: {}", artifact.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{BackupSettings, MemorySettingsStore};
    use async_trait::async_trait;
    use cloudsave_storage::MemoryProvider;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: BackupOrchestrator,
        alpha: Arc<MemoryProvider>,
        beta: Arc<MemoryProvider>,
        store: Arc<MemorySettingsStore>,
        temp: TempDir,
    }

    fn fixture() -> Fixture {
        let alpha = Arc::new(MemoryProvider::new());
        let beta = Arc::new(
            MemoryProvider::authenticated()
                .with_object("save1.zip", b"one".to_vec())
                .with_object("save2.zip", b"two".to_vec())
                .with_object("notes.txt", b"not a snapshot".to_vec()),
        );

        let mut registry = ProviderRegistry::new();
        registry
            .register("alpha", alpha.clone(), "test")
            .unwrap()
            .register("beta", beta.clone(), "test")
            .unwrap();
        registry.lock();

        let store = Arc::new(MemorySettingsStore::default());
        let settings = Arc::new(SharedSettings::load(store.clone()).unwrap());

        let temp = TempDir::new().unwrap();
        let artifacts = temp.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();

        let orchestrator = BackupOrchestrator::new(Arc::new(registry), settings)
            .with_archiver(Archiver::new().with_temp_dir(artifacts))
            .with_retry(RetryPolicy::none());

        Fixture {
            orchestrator,
            alpha,
            beta,
            store,
            temp,
        }
    }

    fn label(name: &str) -> SnapshotLabel {
        SnapshotLabel::new(name).unwrap()
    }

    fn labels(snapshots: Vec<SnapshotLabel>) -> Vec<String> {
        snapshots.iter().map(|l| l.as_str().to_string()).collect()
    }

    fn write_world(root: &Path) {
        std::fs::create_dir_all(root.join("region")).unwrap();
        std::fs::write(root.join("level.dat"), b"level").unwrap();
        std::fs::write(root.join("region").join("r.0.0.mca"), vec![7u8; 4096]).unwrap();
    }

    fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        for name in ["level.dat", "region/r.0.0.mca"] {
            files.insert(name.to_string(), std::fs::read(root.join(name)).unwrap());
        }
        files
    }

    fn leftover_artifacts(fixture: &Fixture) -> usize {
        std::fs::read_dir(fixture.temp.path().join("artifacts"))
            .unwrap()
            .count()
    }

    #[tokio::test]
    async fn test_listing_follows_active_provider() {
        let f = fixture();

        f.orchestrator.set_active_provider("beta").unwrap();
        assert_eq!(
            labels(f.orchestrator.list_remote_snapshots().await),
            vec!["save1".to_string(), "save2".to_string()]
        );

        f.orchestrator.set_active_provider("alpha").unwrap();
        assert!(f.orchestrator.list_remote_snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider_lists_available() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();

        let err = f.orchestrator.set_active_provider("nonexistent").unwrap_err();
        let message = err.to_string();
        for name in f.orchestrator.available_provider_names() {
            assert!(message.contains(&name), "{} missing from {}", name, message);
        }

        // Selection is unchanged
        assert_eq!(f.orchestrator.active_provider_name().as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_selection_is_persisted_normalized() {
        let f = fixture();

        f.orchestrator.set_active_provider("  BETA ").unwrap();

        assert_eq!(f.store.current().active_provider, "beta");
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_active_provider() {
        let f = fixture();
        f.orchestrator
            .settings()
            .update(|s| s.active_provider = "beta".to_string());

        assert!(f.orchestrator.restore_active_provider());
        assert_eq!(f.orchestrator.active_provider_name().as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_restore_unregistered_provider() {
        // Default settings name "gdrive", which is not registered here
        let f = fixture();
        assert_eq!(f.store.current(), BackupSettings::default());

        assert!(!f.orchestrator.restore_active_provider());
        assert!(f.orchestrator.active_provider().is_none());
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();

        let world = f.temp.path().join("world");
        write_world(&world);

        assert!(f.orchestrator.upload_snapshot(&world, &label("My World")).await);
        assert!(f.beta.object("My World.zip").is_some());
        assert_eq!(leftover_artifacts(&f), 0);

        let restored = f.temp.path().join("restored");
        assert!(
            f.orchestrator
                .download_snapshot(&label("My World"), &restored)
                .await
        );
        assert_eq!(read_tree(&restored), read_tree(&world));
        assert_eq!(leftover_artifacts(&f), 0);

        assert!(labels(f.orchestrator.list_remote_snapshots().await)
            .contains(&"My World".to_string()));
    }

    #[tokio::test]
    async fn test_upload_failure_is_swallowed() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();
        f.beta.set_fail_transfers(true);

        let world = f.temp.path().join("world");
        write_world(&world);

        assert!(!f.orchestrator.upload_snapshot(&world, &label("world")).await);
        assert!(f.beta.object("world.zip").is_none());
        assert_eq!(leftover_artifacts(&f), 0);
    }

    #[tokio::test]
    async fn test_upload_missing_source_is_swallowed() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();

        let missing = f.temp.path().join("missing");
        assert!(!f.orchestrator.upload_snapshot(&missing, &label("world")).await);
        assert_eq!(f.beta.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_operations_without_ready_provider() {
        let f = fixture();
        let world = f.temp.path().join("world");
        write_world(&world);

        // Nothing selected
        assert!(!f.orchestrator.upload_snapshot(&world, &label("world")).await);

        // Selected but unauthenticated
        f.orchestrator.set_active_provider("alpha").unwrap();
        assert!(!f.orchestrator.upload_snapshot(&world, &label("world")).await);
        assert!(!f.orchestrator.delete_snapshot(&label("world")).await);
        assert_eq!(f.alpha.object_count(), 0);
        assert_eq!(leftover_artifacts(&f), 0);
    }

    #[tokio::test]
    async fn test_download_missing_snapshot_is_noop() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();

        let target = f.temp.path().join("target");
        assert!(
            !f.orchestrator
                .download_snapshot(&label("missing"), &target)
                .await
        );
        assert!(!target.exists());
        assert_eq!(leftover_artifacts(&f), 0);
    }

    #[tokio::test]
    async fn test_connect_active_provider() {
        let f = fixture();
        assert!(!f.orchestrator.connect_active_provider().await);

        f.orchestrator.set_active_provider("alpha").unwrap();
        assert!(!f.alpha.is_authenticated());
        assert!(f.orchestrator.connect_active_provider().await);
        assert!(f.alpha.is_authenticated());
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let f = fixture();
        f.orchestrator.set_active_provider("beta").unwrap();

        assert!(f.orchestrator.delete_snapshot(&label("save1")).await);
        assert_eq!(
            labels(f.orchestrator.list_remote_snapshots().await),
            vec!["save2".to_string()]
        );
    }

    /// Takes the upload, then leaves a directory where the artifact was so
    /// it cannot be removed afterwards.
    struct ArtifactBlockingProvider;

    #[async_trait]
    impl StorageProvider for ArtifactBlockingProvider {
        fn provider_name(&self) -> &str {
            "Blocking"
        }

        async fn authenticate(&self) -> Result<bool> {
            Ok(true)
        }

        async fn upload(&self, local_file: &Path, _remote_name: &str) -> Result<()> {
            tokio::fs::remove_file(local_file).await?;
            tokio::fs::create_dir(local_file).await?;
            std::fs::write(local_file.join("held"), b"held")?;
            Ok(())
        }

        async fn download(&self, remote_name: &str, _local_file: &Path) -> Result<()> {
            Err(Error::NotFound(remote_name.to_string()))
        }

        async fn delete(&self, _remote_name: &str) -> Result<()> {
            Ok(())
        }

        async fn list_files(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn sign_out(&self) {}

        fn is_authenticated(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_upload_succeeds_when_artifact_cleanup_fails() {
        let temp = TempDir::new().unwrap();
        let artifacts = temp.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        let world = temp.path().join("world");
        write_world(&world);

        let mut registry = ProviderRegistry::new();
        registry
            .register("blocking", Arc::new(ArtifactBlockingProvider), "test")
            .unwrap();
        registry.lock();

        let settings = Arc::new(SharedSettings::in_memory(BackupSettings::default()));
        let orchestrator = BackupOrchestrator::new(Arc::new(registry), settings)
            .with_archiver(Archiver::new().with_temp_dir(&artifacts))
            .with_retry(RetryPolicy::none());
        orchestrator.set_active_provider("blocking").unwrap();

        assert!(orchestrator.upload_snapshot(&world, &label("world")).await);

        // The artifact could not be removed and is still there
        let leftovers: Vec<_> = std::fs::read_dir(&artifacts)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(leftovers.len(), 1);
        assert!(leftovers[0].is_dir());
    }
}
