//! Host integration: provider plugins and lifecycle events.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use cloudsave_common::Result;
use cloudsave_storage::{GDriveConfig, GDriveProvider, LocalProvider, MemoryProvider, ProviderRegistry};

use crate::orchestrator::BackupOrchestrator;
use crate::scheduler::{BackupScheduler, BackupTarget};

/// A bundle of storage providers contributed to the registry at startup.
pub trait ProviderPlugin: Send + Sync {
    /// Identifier reported as the source of each registration.
    fn source_id(&self) -> &str;

    /// Register this plugin's providers.
    ///
    /// Called exactly once, before the registry is locked.
    fn register_providers(&self, registry: &mut ProviderRegistry) -> Result<()>;
}

/// Invoke every plugin once, logging what each one contributed.
///
/// A failing plugin is logged and skipped; providers it registered before
/// failing stay registered. Returns the number of registered providers.
pub fn register_plugins(registry: &mut ProviderRegistry, plugins: &[Box<dyn ProviderPlugin>]) -> usize {
    for plugin in plugins {
        let before = registry.count();

        match plugin.register_providers(registry) {
            Ok(()) => {
                let added = registry.count() - before;
                info!(
                    "'{}' registered {} storage {}",
                    plugin.source_id(),
                    added,
                    if added == 1 { "provider" } else { "providers" }
                );
            }
            Err(e) => {
                error!(
                    "'{}' failed to register its storage providers: {}",
                    plugin.source_id(),
                    e
                );
            }
        }
    }

    registry.count()
}

/// Run plugin discovery and lock the resulting registry.
pub fn build_registry(plugins: &[Box<dyn ProviderPlugin>]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    register_plugins(&mut registry, plugins);
    registry.lock();
    registry
}

/// Providers shipped with CloudSave: `memory`, `local` and `gdrive`.
pub struct BuiltinProviders {
    local_root: PathBuf,
    gdrive: GDriveConfig,
}

impl BuiltinProviders {
    /// Source identifier of the builtin providers.
    pub const SOURCE_ID: &'static str = "cloudsave";

    /// Create the builtin plugin.
    ///
    /// `local_root` is the directory the `local` provider stores into.
    pub fn new(local_root: impl Into<PathBuf>, gdrive: GDriveConfig) -> Self {
        Self {
            local_root: local_root.into(),
            gdrive,
        }
    }
}

impl ProviderPlugin for BuiltinProviders {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    fn register_providers(&self, registry: &mut ProviderRegistry) -> Result<()> {
        registry
            .register("memory", Arc::new(MemoryProvider::new()), Self::SOURCE_ID)?
            .register(
                "local",
                Arc::new(LocalProvider::new(&self.local_root)),
                Self::SOURCE_ID,
            )?
            .register(
                "gdrive",
                Arc::new(GDriveProvider::new(self.gdrive.clone())),
                Self::SOURCE_ID,
            )?;
        Ok(())
    }
}

/// Reacts to the host starting and stopping.
pub struct LifecycleHandler {
    orchestrator: Arc<BackupOrchestrator>,
    scheduler: Arc<BackupScheduler>,
}

impl LifecycleHandler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, scheduler: Arc<BackupScheduler>) -> Self {
        Self {
            orchestrator,
            scheduler,
        }
    }

    /// The host has started and can run backups on `target.context`.
    pub fn on_started(&self, target: BackupTarget) {
        info!(label = %target.label, "Host started; scheduling backups of {}", target.source_dir.display());
        self.scheduler.start(target);
    }

    /// The host is stopping: cancel the timer, then take one final backup
    /// and wait for it to finish.
    pub async fn on_stopping(&self) {
        let Some(target) = self.scheduler.unbind() else {
            warn!("Host stopping without a bound backup target");
            return;
        };

        info!(label = %target.label, "Host stopping; taking a final backup");

        let orchestrator = self.orchestrator.clone();
        let source_dir = target.source_dir.clone();
        let label = target.label.clone();
        let result = target
            .context
            .run(async move {
                orchestrator.upload_snapshot(&source_dir, &label).await;
            })
            .await;

        if let Err(e) = result {
            error!(label = %target.label, "Final backup did not run: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SerialExecutor;
    use crate::retry::RetryPolicy;
    use crate::settings::{BackupSettings, SharedSettings};
    use cloudsave_archive::Archiver;
    use cloudsave_common::{Error, SnapshotLabel};
    use tempfile::TempDir;

    struct NamedPlugin {
        id: &'static str,
        names: Vec<&'static str>,
    }

    impl ProviderPlugin for NamedPlugin {
        fn source_id(&self) -> &str {
            self.id
        }

        fn register_providers(&self, registry: &mut ProviderRegistry) -> Result<()> {
            for name in &self.names {
                registry.register(name, Arc::new(MemoryProvider::new()), self.id)?;
            }
            Ok(())
        }
    }

    fn plugin(id: &'static str, names: &[&'static str]) -> Box<dyn ProviderPlugin> {
        Box::new(NamedPlugin {
            id,
            names: names.to_vec(),
        })
    }

    #[test]
    fn test_build_registry_locks() {
        let registry = build_registry(&[plugin("modA", &["alpha"]), plugin("modB", &["beta"])]);

        assert!(registry.is_locked());
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.source_of("beta"), Some("modB"));
    }

    #[test]
    fn test_failing_plugin_is_skipped() {
        // modB collides on its second provider
        let registry = build_registry(&[
            plugin("modA", &["Drop Box"]),
            plugin("modB", &["gamma", "drop_box"]),
            plugin("modC", &["delta"]),
        ]);

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.source_of("drop box"), Some("modA"));
        assert_eq!(registry.source_of("gamma"), Some("modB"));
        assert!(registry.is_registered("delta"));
    }

    #[test]
    fn test_late_registration_fails() {
        let mut registry = build_registry(&[plugin("modA", &["alpha"])]);

        let late = plugin("late", &["omega"]);
        assert!(matches!(
            late.register_providers(&mut registry),
            Err(Error::RegistryLocked)
        ));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_builtin_providers() {
        let temp = TempDir::new().unwrap();
        let builtin: Box<dyn ProviderPlugin> = Box::new(BuiltinProviders::new(
            temp.path().join("local"),
            GDriveConfig::new(temp.path().join("tokens")),
        ));
        let registry = build_registry(&[builtin]);

        let names: Vec<_> = registry.all_names().into_iter().collect();
        assert_eq!(names, vec!["gdrive", "local", "memory"]);
        assert_eq!(registry.source_of("gdrive"), Some(BuiltinProviders::SOURCE_ID));
        assert_eq!(
            registry.lookup("gdrive").unwrap().provider_name(),
            "Google Drive"
        );
    }

    #[tokio::test]
    async fn test_lifecycle_final_backup() {
        let temp = TempDir::new().unwrap();
        let world = temp.path().join("world");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("level.dat"), b"level").unwrap();
        let artifacts = temp.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();

        let provider = Arc::new(MemoryProvider::authenticated());
        let mut registry = ProviderRegistry::new();
        registry.register("memory", provider.clone(), "test").unwrap();
        registry.lock();

        // Keep the timer out of the way; only the final backup should run
        let settings = Arc::new(SharedSettings::in_memory(BackupSettings {
            active_provider: "memory".to_string(),
            auto_backups_enabled: false,
            backup_interval_seconds: 3600,
        }));
        let orchestrator = Arc::new(
            BackupOrchestrator::new(Arc::new(registry), settings)
                .with_archiver(Archiver::new().with_temp_dir(artifacts))
                .with_retry(RetryPolicy::none()),
        );
        assert!(orchestrator.restore_active_provider());

        let scheduler = Arc::new(BackupScheduler::new(orchestrator.clone()));
        let lifecycle = LifecycleHandler::new(orchestrator, scheduler.clone());
        let (context, worker) = SerialExecutor::spawn();

        lifecycle.on_started(BackupTarget {
            context: context.clone(),
            source_dir: world,
            label: SnapshotLabel::new("world").unwrap(),
        });
        assert!(scheduler.target().is_some());

        lifecycle.on_stopping().await;

        assert_eq!(provider.upload_count(), 1);
        assert!(provider.object("world.zip").is_some());
        assert!(scheduler.target().is_none());

        // A second stop has nothing left to do
        lifecycle.on_stopping().await;
        assert_eq!(provider.upload_count(), 1);

        context.shutdown();
        worker.await.unwrap();
    }
}
