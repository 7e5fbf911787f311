//! CloudSave CLI - Command line interface for snapshot backups.
//!
//! This tool hosts the backup engine outside of a game server: it can
//! back up and restore a directory once, manage settings, sign in to
//! Google Drive, or run the periodic scheduler until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloudsave_backup::{
    build_registry, default_settings_path, default_tokens_dir, BackupOrchestrator,
    BackupScheduler, BackupTarget, BuiltinProviders, JsonSettingsStore, LifecycleHandler,
    ProviderPlugin, SerialExecutor, SharedSettings,
};
use cloudsave_common::SnapshotLabel;
use cloudsave_storage::gdrive::{AuthManager, TokenStore};
use cloudsave_storage::GDriveConfig;

#[derive(Parser)]
#[command(name = "cloudsave")]
#[command(about = "CloudSave - Periodic directory backups to cloud storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (default: per-user config directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding provider credentials.
    #[arg(long, global = true)]
    tokens_dir: Option<PathBuf>,

    /// Directory the `local` provider stores snapshots in.
    #[arg(long, global = true)]
    local_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered storage providers.
    Providers,

    /// Select the active storage provider.
    Use {
        /// Provider name, e.g. "gdrive" or "local".
        name: String,
    },

    /// Set the number of seconds between automatic backups.
    Interval {
        /// Seconds between backups.
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
    },

    /// Turn automatic backups on or off.
    Auto {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Back up a directory once.
    Backup {
        /// Directory to back up.
        #[arg(short, long)]
        source: PathBuf,

        /// Snapshot label (default: the directory name).
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Restore a snapshot into a directory.
    Restore {
        /// Snapshot label.
        #[arg(short, long)]
        label: String,

        /// Directory to restore into.
        #[arg(short, long)]
        target: PathBuf,
    },

    /// List snapshots stored with the active provider.
    List,

    /// Delete a snapshot from the active provider.
    Delete {
        /// Snapshot label.
        #[arg(short, long)]
        label: String,
    },

    /// Back up a directory periodically until interrupted.
    Run {
        /// Directory to back up.
        #[arg(short, long)]
        source: PathBuf,

        /// Snapshot label (default: the directory name).
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Sign in to Google Drive.
    Login,

    /// Sign out of the active provider.
    Logout,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Resolved locations for settings and provider data.
struct Paths {
    settings: PathBuf,
    tokens_dir: PathBuf,
    local_root: PathBuf,
}

impl Paths {
    fn resolve(cli: &Cli) -> Result<Self> {
        let settings = match &cli.settings {
            Some(path) => path.clone(),
            None => default_settings_path().context("Could not determine the config directory")?,
        };
        let tokens_dir = match &cli.tokens_dir {
            Some(path) => path.clone(),
            None => default_tokens_dir().context("Could not determine the data directory")?,
        };
        let local_root = match &cli.local_root {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .context("Could not determine the data directory")?
                .join("cloudsave")
                .join("backups"),
        };

        Ok(Self {
            settings,
            tokens_dir,
            local_root,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let paths = Paths::resolve(&cli)?;

    match cli.command {
        Commands::Providers => cmd_providers(&paths),

        Commands::Use { name } => cmd_use(&paths, &name),

        Commands::Interval { seconds } => cmd_interval(&paths, seconds),

        Commands::Auto { state } => cmd_auto(&paths, state),

        Commands::Backup { source, label } => cmd_backup(&paths, &source, label).await,

        Commands::Restore { label, target } => cmd_restore(&paths, &label, &target).await,

        Commands::List => cmd_list(&paths).await,

        Commands::Delete { label } => cmd_delete(&paths, &label).await,

        Commands::Run { source, label } => cmd_run(&paths, &source, label).await,

        Commands::Login => cmd_login(&paths).await,

        Commands::Logout => cmd_logout(&paths).await,
    }
}

/// Load settings, discover providers and restore the active one.
fn open_orchestrator(paths: &Paths) -> Result<Arc<BackupOrchestrator>> {
    let store = Arc::new(JsonSettingsStore::new(&paths.settings));
    let settings = SharedSettings::load(store).context("Failed to load settings")?;

    let plugins: Vec<Box<dyn ProviderPlugin>> = vec![Box::new(BuiltinProviders::new(
        &paths.local_root,
        GDriveConfig::new(&paths.tokens_dir),
    ))];
    let registry = build_registry(&plugins);

    let orchestrator = BackupOrchestrator::new(Arc::new(registry), Arc::new(settings));
    if !orchestrator.restore_active_provider() {
        warn!(
            "Choose a provider with `cloudsave use <name>` ({})",
            orchestrator.available_provider_names().join(", ")
        );
    }

    Ok(Arc::new(orchestrator))
}

/// Open the orchestrator and sign in to the active provider.
async fn connect(paths: &Paths) -> Result<Arc<BackupOrchestrator>> {
    let orchestrator = open_orchestrator(paths)?;
    if !orchestrator.connect_active_provider().await {
        anyhow::bail!("Active storage provider is not ready; see the log above");
    }
    Ok(orchestrator)
}

fn snapshot_label(source: &Path, label: Option<String>) -> Result<SnapshotLabel> {
    let label = match label {
        Some(label) => label,
        None => source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Cannot derive a label from the source path; pass --label")?,
    };
    SnapshotLabel::new(label).context("Invalid snapshot label")
}

/// List registered providers.
fn cmd_providers(paths: &Paths) -> Result<()> {
    let orchestrator = open_orchestrator(paths)?;
    let active = orchestrator.active_provider_name();

    println!("Storage providers:");
    for registration in orchestrator.registry().registrations() {
        let marker = if active.as_deref() == Some(registration.name().as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "  {} {} ({}, from {})",
            marker,
            registration.name(),
            registration.provider().provider_name(),
            registration.source_id()
        );
    }

    Ok(())
}

/// Select the active provider.
fn cmd_use(paths: &Paths, name: &str) -> Result<()> {
    let orchestrator = open_orchestrator(paths)?;
    orchestrator
        .set_active_provider(name)
        .context("Failed to select provider")?;

    println!(
        "Active provider: {}",
        orchestrator.active_provider_name().unwrap_or_default()
    );
    Ok(())
}

/// Set the backup interval.
fn cmd_interval(paths: &Paths, seconds: i64) -> Result<()> {
    let orchestrator = open_orchestrator(paths)?;
    let scheduler = BackupScheduler::new(orchestrator);
    scheduler
        .set_interval(seconds)
        .context("Failed to set interval")?;

    println!("Backing up every {} seconds", seconds);
    Ok(())
}

/// Toggle automatic backups.
fn cmd_auto(paths: &Paths, state: Toggle) -> Result<()> {
    let orchestrator = open_orchestrator(paths)?;
    let scheduler = BackupScheduler::new(orchestrator);
    let enabled = matches!(state, Toggle::On);
    scheduler.set_auto_backups(enabled);

    println!(
        "Automatic backups {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Back up a directory once.
async fn cmd_backup(paths: &Paths, source: &Path, label: Option<String>) -> Result<()> {
    let label = snapshot_label(source, label)?;
    let orchestrator = connect(paths).await?;

    if !orchestrator.upload_snapshot(source, &label).await {
        anyhow::bail!("Backup of {} failed", source.display());
    }

    println!("Backed up {} as {}", source.display(), label.remote_name());
    Ok(())
}

/// Restore a snapshot.
async fn cmd_restore(paths: &Paths, label: &str, target: &Path) -> Result<()> {
    let label = SnapshotLabel::new(label).context("Invalid snapshot label")?;
    let orchestrator = connect(paths).await?;

    if !orchestrator.download_snapshot(&label, target).await {
        anyhow::bail!("Restore of {} failed", label);
    }

    println!("Restored {} into {}", label, target.display());
    Ok(())
}

/// List remote snapshots.
async fn cmd_list(paths: &Paths) -> Result<()> {
    let orchestrator = connect(paths).await?;
    let snapshots = orchestrator.list_remote_snapshots().await;

    if snapshots.is_empty() {
        println!("No snapshots.");
    } else {
        println!("Snapshots:");
        for label in snapshots {
            println!("  {}", label);
        }
    }

    Ok(())
}

/// Delete a remote snapshot.
async fn cmd_delete(paths: &Paths, label: &str) -> Result<()> {
    let label = SnapshotLabel::new(label).context("Invalid snapshot label")?;
    let orchestrator = connect(paths).await?;

    if !orchestrator.delete_snapshot(&label).await {
        anyhow::bail!("Failed to delete {}", label);
    }

    println!("Deleted {}", label.remote_name());
    Ok(())
}

/// Host the scheduler until Ctrl-C, then take a final backup.
async fn cmd_run(paths: &Paths, source: &Path, label: Option<String>) -> Result<()> {
    let label = snapshot_label(source, label)?;
    let orchestrator = connect(paths).await?;
    let scheduler = Arc::new(BackupScheduler::new(orchestrator.clone()));
    let lifecycle = LifecycleHandler::new(orchestrator, scheduler);

    let (context, worker) = SerialExecutor::spawn();
    lifecycle.on_started(BackupTarget {
        context: context.clone(),
        source_dir: source.to_path_buf(),
        label,
    });

    println!("Running; press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    lifecycle.on_stopping().await;
    context.shutdown();
    worker.await.context("Execution context failed")?;

    info!("Stopped");
    Ok(())
}

/// Run the OAuth2 flow for Google Drive and store the tokens.
async fn cmd_login(paths: &Paths) -> Result<()> {
    let config = GDriveConfig::new(&paths.tokens_dir);
    let auth = AuthManager::new(config.auth_config).context("Failed to set up sign-in")?;
    let (url, state) = auth.authorization_url();

    println!("Open this URL to sign in to Google Drive:\n\n  {}\n", url);
    if let Err(e) = open::that(&url) {
        warn!("Could not open a browser: {}", e);
    }

    print!("Paste the URL you were redirected to: ");
    io::stdout().flush()?;
    let mut redirect = String::new();
    io::stdin()
        .lock()
        .read_line(&mut redirect)
        .context("Failed to read redirect URL")?;

    let code = AuthManager::code_from_redirect(&redirect, &state)
        .context("Failed to read the authorization code")?;
    let tokens = auth
        .exchange_code(&code)
        .await
        .context("Failed to exchange authorization code")?;

    let store = TokenStore::new(&paths.tokens_dir);
    store.save(&tokens).await.context("Failed to save tokens")?;

    println!("Signed in. Tokens saved to {}", store.path().display());
    Ok(())
}

/// Sign out of the active provider.
async fn cmd_logout(paths: &Paths) -> Result<()> {
    let orchestrator = open_orchestrator(paths)?;
    let provider = orchestrator
        .active_provider()
        .context("No active storage provider")?;

    provider.sign_out().await;
    println!("Signed out of {}", provider.provider_name());
    Ok(())
}
