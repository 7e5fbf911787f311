//! Local filesystem storage provider.
//!
//! A directory stands in for the remote location, which makes it handy for
//! NAS mounts and synced folders as well as for tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::provider::StorageProvider;
use cloudsave_common::{Error, Result};

/// Local filesystem storage provider.
///
/// Objects are plain files directly inside the root directory.
pub struct LocalProvider {
    root: PathBuf,
    authenticated: AtomicBool,
}

impl LocalProvider {
    /// Create a new local provider for the given root directory.
    ///
    /// The directory is created on [`authenticate`](StorageProvider::authenticate),
    /// not here, so constructing a provider never touches the filesystem.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Map an object name to its file, rejecting anything that is not a
    /// plain file name.
    fn object_path(&self, remote_name: &str) -> Result<PathBuf> {
        let valid = !remote_name.is_empty()
            && remote_name != "."
            && remote_name != ".."
            && !remote_name.contains(['/', '\\']);
        if !valid {
            return Err(Error::InvalidInput(format!(
                "Invalid object name: '{}'",
                remote_name
            )));
        }
        Ok(self.root.join(remote_name))
    }

    fn ensure_authenticated(&self) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::Authentication(format!(
                "Local folder {} is not connected",
                self.root.display()
            )))
        }
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn provider_name(&self) -> &str {
        "Local Folder"
    }

    async fn authenticate(&self) -> Result<bool> {
        fs::create_dir_all(&self.root).await?;
        self.authenticated.store(true, Ordering::SeqCst);
        debug!("Using local folder {}", self.root.display());
        Ok(true)
    }

    async fn upload(&self, local_file: &Path, remote_name: &str) -> Result<()> {
        self.ensure_authenticated()?;
        let target = self.object_path(remote_name)?;

        // Write beside the target first so a failed copy never clobbers the
        // previous object.
        let staging = self
            .root
            .join(format!(".{}.{}.part", remote_name, Uuid::new_v4().simple()));
        let staged = match fs::copy(local_file, &staging).await {
            Ok(_) => fs::rename(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn download(&self, remote_name: &str, local_file: &Path) -> Result<()> {
        self.ensure_authenticated()?;
        let source = self.object_path(remote_name)?;

        if !fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("File not found: {}", remote_name)));
        }

        fs::copy(&source, local_file).await?;
        Ok(())
    }

    async fn delete(&self, remote_name: &str) -> Result<()> {
        self.ensure_authenticated()?;
        let path = self.object_path(remote_name)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_authenticated()?;

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // In-flight uploads
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    async fn sign_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}
