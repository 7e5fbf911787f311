//! Periodic and manual backup scheduling.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use cloudsave_common::{Error, Result, SnapshotLabel};

use crate::executor::ExecutionContext;
use crate::orchestrator::BackupOrchestrator;
use crate::settings::SharedSettings;

/// What the scheduler backs up, and where the work runs.
#[derive(Debug, Clone)]
pub struct BackupTarget {
    /// The host's serialized execution context.
    pub context: ExecutionContext,
    /// Directory to snapshot.
    pub source_dir: PathBuf,
    /// Label the snapshot is stored under.
    pub label: SnapshotLabel,
}

/// A live timer task. Dropping it stops the timer.
struct Timer {
    _stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ScheduleState {
    target: Option<BackupTarget>,
    timer: Option<Timer>,
}

/// Runs backups at a fixed rate and on demand.
///
/// Must be used from within a tokio runtime.
pub struct BackupScheduler {
    orchestrator: Arc<BackupOrchestrator>,
    settings: Arc<SharedSettings>,
    state: Mutex<ScheduleState>,
}

impl BackupScheduler {
    /// Create a stopped scheduler.
    pub fn new(orchestrator: Arc<BackupOrchestrator>) -> Self {
        let settings = orchestrator.settings().clone();
        Self {
            orchestrator,
            settings,
            state: Mutex::new(ScheduleState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `target` and start the periodic timer.
    ///
    /// The first backup is dispatched immediately. Any previous timer is
    /// cancelled first. Only binds when automatic backups are disabled.
    pub fn start(&self, target: BackupTarget) {
        let mut state = self.lock();
        state.target = Some(target.clone());
        state.timer = None;

        let settings = self.settings.snapshot();
        if !settings.auto_backups_enabled {
            info!("Automatic backups are disabled");
            return;
        }

        let period = Duration::from_secs(settings.backup_interval_seconds.max(1));
        info!(label = %target.label, "Backing up every {} seconds", period.as_secs());
        state.timer = Some(self.spawn_timer(target, period));
    }

    fn spawn_timer(&self, target: BackupTarget, period: Duration) -> Timer {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let orchestrator = self.orchestrator.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        debug!(label = %target.label, "Scheduled backup");
                        dispatch(&orchestrator, &target);
                    }
                }
            }

            debug!("Backup timer stopped");
        });

        Timer {
            _stop: stop_tx,
            task,
        }
    }

    /// Cancel the periodic timer. Idempotent.
    ///
    /// A backup already handed to the execution context still runs.
    pub fn stop(&self) {
        if self.lock().timer.take().is_some() {
            info!("Stopped automatic backups");
        }
    }

    /// Stop and forget the bound target.
    pub fn unbind(&self) -> Option<BackupTarget> {
        self.stop();
        self.lock().target.take()
    }

    /// Whether a timer is live.
    pub fn is_running(&self) -> bool {
        self.lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    /// The bound target, if any.
    pub fn target(&self) -> Option<BackupTarget> {
        self.lock().target.clone()
    }

    /// Dispatch one backup now.
    ///
    /// Returns whether a backup was queued.
    pub fn trigger_manual_backup(&self) -> bool {
        let Some(target) = self.target() else {
            warn!("Tried to trigger a backup before a target was bound");
            return false;
        };

        info!(label = %target.label, "Manual backup requested");
        dispatch(&self.orchestrator, &target)
    }

    /// Change the interval between backups and persist it.
    ///
    /// A running timer is restarted with the new interval.
    ///
    /// # Errors
    /// - `InvalidInterval` if `seconds` is not positive
    pub fn set_interval(&self, seconds: i64) -> Result<()> {
        if seconds <= 0 {
            return Err(Error::InvalidInterval(seconds));
        }

        self.settings
            .update(|s| s.backup_interval_seconds = seconds as u64);
        info!("Backup interval set to {} seconds", seconds);

        self.restart_if_running();
        Ok(())
    }

    /// Turn periodic backups on or off and persist the choice.
    pub fn set_auto_backups(&self, enabled: bool) {
        self.settings.update(|s| s.auto_backups_enabled = enabled);

        if !enabled {
            self.stop();
        } else if !self.is_running() {
            if let Some(target) = self.target() {
                self.start(target);
            }
        }
    }

    fn restart_if_running(&self) {
        if !self.is_running() {
            return;
        }
        if let Some(target) = self.target() {
            self.start(target);
        }
    }
}

/// Queue one backup of `target` on its execution context.
fn dispatch(orchestrator: &Arc<BackupOrchestrator>, target: &BackupTarget) -> bool {
    let orchestrator = orchestrator.clone();
    let source_dir = target.source_dir.clone();
    let label = target.label.clone();

    let queued = target.context.execute(async move {
        orchestrator.upload_snapshot(&source_dir, &label).await;
    });

    match queued {
        Ok(()) => true,
        Err(e) => {
            warn!(label = %target.label, "Could not queue backup: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Message, SerialExecutor};
    use crate::retry::RetryPolicy;
    use crate::settings::{BackupSettings, MemorySettingsStore};
    use cloudsave_archive::Archiver;
    use cloudsave_storage::{MemoryProvider, ProviderRegistry};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::sleep;

    struct Fixture {
        scheduler: BackupScheduler,
        provider: Arc<MemoryProvider>,
        store: Arc<MemorySettingsStore>,
        temp: TempDir,
    }

    fn fixture(settings: BackupSettings) -> Fixture {
        let provider = Arc::new(MemoryProvider::authenticated());
        let mut registry = ProviderRegistry::new();
        registry.register("memory", provider.clone(), "test").unwrap();
        registry.lock();

        let store = Arc::new(MemorySettingsStore::new(settings));
        let shared = Arc::new(SharedSettings::load(store.clone()).unwrap());

        let temp = TempDir::new().unwrap();
        let artifacts = temp.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::create_dir_all(temp.path().join("world")).unwrap();
        std::fs::write(temp.path().join("world").join("level.dat"), b"level").unwrap();

        let orchestrator = BackupOrchestrator::new(Arc::new(registry), shared)
            .with_archiver(Archiver::new().with_temp_dir(artifacts))
            .with_retry(RetryPolicy::none());
        orchestrator.set_active_provider("memory").unwrap();

        Fixture {
            scheduler: BackupScheduler::new(Arc::new(orchestrator)),
            provider,
            store,
            temp,
        }
    }

    fn settings_every(seconds: u64) -> BackupSettings {
        BackupSettings {
            active_provider: "memory".to_string(),
            auto_backups_enabled: true,
            backup_interval_seconds: seconds,
        }
    }

    fn target(f: &Fixture, context: ExecutionContext) -> BackupTarget {
        BackupTarget {
            context,
            source_dir: f.temp.path().join("world"),
            label: SnapshotLabel::new("world").unwrap(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_immediately_then_at_fixed_rate() {
        let f = fixture(settings_every(60));
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        assert!(f.scheduler.is_running());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), 1);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(drain(&mut rx), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_keeps_one_timer() {
        let f = fixture(settings_every(60));
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context.clone()));
        f.scheduler.start(target(&f, context));

        // Fires at 0, 60 and 120
        sleep(Duration::from_secs(150)).await;
        assert_eq!(drain(&mut rx), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_future_fires() {
        let f = fixture(settings_every(60));
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), 1);

        f.scheduler.stop();
        f.scheduler.stop();
        assert!(!f.scheduler.is_running());

        sleep(Duration::from_secs(600)).await;
        assert_eq!(drain(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_auto_backups_only_bind() {
        let mut settings = settings_every(60);
        settings.auto_backups_enabled = false;
        let f = fixture(settings);
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        assert!(!f.scheduler.is_running());
        assert!(f.scheduler.target().is_some());

        sleep(Duration::from_secs(600)).await;
        assert_eq!(drain(&mut rx), 0);

        // Manual backups still work
        assert!(f.scheduler.trigger_manual_backup());
        assert_eq!(drain(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backup_keeps_schedule() {
        let f = fixture(settings_every(60));
        f.provider.set_fail_transfers(true);
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        sleep(Duration::from_secs(1)).await;

        // Run the first backup; it fails inside the orchestrator
        match rx.try_recv() {
            Ok(Message::Job { job, .. }) => job.await,
            _ => panic!("expected a queued backup"),
        }
        assert_eq!(f.provider.upload_count(), 0);
        assert!(f.scheduler.is_running());

        sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut rx) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_restarts_running_timer() {
        let f = fixture(settings_every(3600));
        let (context, mut rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(drain(&mut rx), 1);

        f.scheduler.set_interval(10).unwrap();
        assert_eq!(f.store.current().backup_interval_seconds, 10);

        // Restart fires immediately, then every 10 seconds
        sleep(Duration::from_secs(25)).await;
        assert_eq!(drain(&mut rx), 3);
    }

    #[tokio::test]
    async fn test_set_interval_rejects_non_positive() {
        let f = fixture(settings_every(60));
        let saves = f.store.save_count();

        assert!(matches!(
            f.scheduler.set_interval(0),
            Err(Error::InvalidInterval(0))
        ));
        assert!(matches!(
            f.scheduler.set_interval(-5),
            Err(Error::InvalidInterval(-5))
        ));
        assert_eq!(f.store.save_count(), saves);
        assert_eq!(f.store.current().backup_interval_seconds, 60);
    }

    #[tokio::test]
    async fn test_set_interval_while_stopped_does_not_start() {
        let f = fixture(settings_every(60));

        f.scheduler.set_interval(30).unwrap();

        assert!(!f.scheduler.is_running());
        assert_eq!(f.store.current().backup_interval_seconds, 30);
    }

    #[tokio::test]
    async fn test_manual_backup_without_target() {
        let f = fixture(settings_every(60));
        assert!(!f.scheduler.trigger_manual_backup());
    }

    #[tokio::test]
    async fn test_manual_backup_runs_on_context() {
        let f = fixture(settings_every(60));
        let (context, _worker) = SerialExecutor::spawn();

        f.scheduler.set_auto_backups(false);
        f.scheduler.start(target(&f, context.clone()));
        assert!(f.scheduler.trigger_manual_backup());

        // FIFO: once this runs, the backup has finished
        context.run(async {}).await.unwrap();
        assert!(f.provider.object("world.zip").is_some());
        assert_eq!(f.provider.upload_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_auto_backups() {
        let f = fixture(settings_every(60));
        let (context, _rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        assert!(f.scheduler.is_running());

        f.scheduler.set_auto_backups(false);
        assert!(!f.scheduler.is_running());
        assert!(!f.store.current().auto_backups_enabled);

        f.scheduler.set_auto_backups(true);
        assert!(f.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_unbind_forgets_target() {
        let f = fixture(settings_every(60));
        let (context, _rx) = ExecutionContext::detached();

        f.scheduler.start(target(&f, context));
        assert!(f.scheduler.unbind().is_some());
        assert!(!f.scheduler.is_running());
        assert!(!f.scheduler.trigger_manual_backup());
    }
}
