//! Google Drive storage provider implementation.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use cloudsave_common::{Error, Result};

use crate::provider::StorageProvider;

use super::auth::{AuthConfig, AuthManager, TokenManager, TokenStore, Tokens};
use super::client::DriveClient;

/// Folder in the user's drive that holds every backup.
pub const DEFAULT_FOLDER_NAME: &str = "CloudSave";

/// Artifacts above this size go through a resumable upload session.
const RESUMABLE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Google Drive provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// Directory holding persisted credentials of all providers.
    pub tokens_dir: PathBuf,
    /// Name of the backup folder at the drive root.
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
    /// OAuth2 client configuration.
    #[serde(default)]
    pub auth_config: AuthConfig,
}

fn default_folder_name() -> String {
    DEFAULT_FOLDER_NAME.to_string()
}

impl GDriveConfig {
    /// Configuration with the default folder and OAuth2 client.
    pub fn new(tokens_dir: impl Into<PathBuf>) -> Self {
        Self {
            tokens_dir: tokens_dir.into(),
            folder_name: default_folder_name(),
            auth_config: AuthConfig::default(),
        }
    }
}

#[derive(Clone)]
struct Session {
    client: Arc<DriveClient>,
    folder_id: String,
}

/// Google Drive storage provider.
///
/// Holds no session until [`authenticate`](StorageProvider::authenticate)
/// finds stored credentials.
pub struct GDriveProvider {
    config: GDriveConfig,
    store: TokenStore,
    session: RwLock<Option<Session>>,
}

impl GDriveProvider {
    /// Create a new, unauthenticated Google Drive provider.
    pub fn new(config: GDriveConfig) -> Self {
        let store = TokenStore::new(&config.tokens_dir);
        Self {
            config,
            store,
            session: RwLock::new(None),
        }
    }

    /// Store for this provider's credentials.
    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    fn session(&self) -> Result<Session> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::Authentication("Not signed in to Google Drive".to_string()))
    }

    fn set_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    /// Open a session from `tokens` and resolve the backup folder.
    async fn connect(&self, tokens: Tokens) -> Result<Session> {
        let auth_manager = Arc::new(AuthManager::new(self.config.auth_config.clone())?);
        let token_manager =
            Arc::new(TokenManager::new(auth_manager, tokens).with_store(self.store.clone()));
        let client = Arc::new(DriveClient::new(token_manager)?);

        let folder_id = match client.find_folder(&self.config.folder_name, "root").await? {
            Some(folder) => folder.id,
            None => {
                info!("Creating Google Drive folder '{}'", self.config.folder_name);
                client
                    .create_folder(&self.config.folder_name, None)
                    .await?
                    .id
            }
        };

        Ok(Session { client, folder_id })
    }
}

#[async_trait]
impl StorageProvider for GDriveProvider {
    fn provider_name(&self) -> &str {
        "Google Drive"
    }

    async fn authenticate(&self) -> Result<bool> {
        if self.is_authenticated() {
            return Ok(true);
        }

        let Some(tokens) = self.store.load().await? else {
            info!(
                "No stored Google Drive credentials in {}",
                self.store.dir().display()
            );
            return Ok(false);
        };

        let session = self.connect(tokens).await?;
        debug!("Google Drive folder id {}", session.folder_id);
        self.set_session(Some(session));

        Ok(true)
    }

    async fn upload(&self, local_file: &Path, remote_name: &str) -> Result<()> {
        let session = self.session()?;
        let size = fs::metadata(local_file).await?.len();

        let existing = session
            .client
            .find_file(remote_name, &session.folder_id)
            .await?;

        let file = if size > RESUMABLE_THRESHOLD {
            let reader = fs::File::open(local_file).await?;
            let stream = ReaderStream::new(reader).map(|chunk| chunk.map_err(Error::from));
            session
                .client
                .upload_resumable(
                    remote_name,
                    &session.folder_id,
                    existing.as_ref().map(|f| f.id.as_str()),
                    Box::pin(stream),
                    size,
                )
                .await?
        } else {
            let data = fs::read(local_file).await?;
            match existing {
                Some(existing) => session.client.update_file(&existing.id, data).await?,
                None => {
                    session
                        .client
                        .upload_simple(remote_name, &session.folder_id, data)
                        .await?
                }
            }
        };

        debug!("Uploaded {} ({} bytes) as file {}", remote_name, size, file.id);
        Ok(())
    }

    async fn download(&self, remote_name: &str, local_file: &Path) -> Result<()> {
        let session = self.session()?;

        let file = session
            .client
            .find_file(remote_name, &session.folder_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", remote_name)))?;

        let written = session.client.download_to(&file.id, local_file).await?;
        debug!("Downloaded {} ({} bytes)", remote_name, written);

        Ok(())
    }

    async fn delete(&self, remote_name: &str) -> Result<()> {
        let session = self.session()?;

        match session
            .client
            .find_file(remote_name, &session.folder_id)
            .await?
        {
            Some(file) => session.client.delete(&file.id).await,
            None => {
                debug!("Nothing to delete for {}", remote_name);
                Ok(())
            }
        }
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        let session = self.session()?;

        let files = session.client.list_folder(&session.folder_id).await?;
        Ok(files
            .into_iter()
            .filter(|f| !f.is_folder())
            .map(|f| f.name)
            .collect())
    }

    async fn sign_out(&self) {
        self.set_session(None);

        match self.store.clear().await {
            Ok(()) => info!("Signed out of Google Drive"),
            Err(e) => warn!(
                "Failed to delete Google Drive credentials in {}: {}",
                self.store.dir().display(),
                e
            ),
        }
    }

    fn is_authenticated(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
