//! Storage provider trait definition.

use async_trait::async_trait;
use std::path::Path;

use cloudsave_common::Result;

/// Storage provider trait for different backends.
///
/// A provider stores flat, named objects in one backup location of a remote
/// service. Implementations manage their own authentication state, so every
/// method takes `&self` and providers are shared as `Arc<dyn StorageProvider>`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Human-readable provider name (e.g., "Google Drive").
    fn provider_name(&self) -> &str;

    /// Authenticate with the remote service.
    ///
    /// # Returns
    /// - `Ok(true)` once the provider is ready for transfers
    /// - `Ok(false)` if no usable credentials are available
    ///
    /// # Errors
    /// - Credentials were rejected or could not be refreshed
    async fn authenticate(&self) -> Result<bool>;

    /// Upload a local file under `remote_name`.
    ///
    /// # Postconditions
    /// - Exactly one object named `remote_name` exists; a previous object of
    ///   the same name is replaced, never duplicated
    ///
    /// # Errors
    /// - Not authenticated
    /// - Local file unreadable
    /// - Network errors
    async fn upload(&self, local_file: &Path, remote_name: &str) -> Result<()>;

    /// Download `remote_name` into `local_file`, replacing its contents.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    /// - Not authenticated
    /// - Network/I/O errors
    async fn download(&self, remote_name: &str, local_file: &Path) -> Result<()>;

    /// Delete `remote_name`.
    ///
    /// # Errors
    /// - Not authenticated
    /// - Network errors
    async fn delete(&self, remote_name: &str) -> Result<()>;

    /// List the names of all stored objects.
    ///
    /// Either the complete list or an error; an empty list is a valid result.
    async fn list_files(&self) -> Result<Vec<String>>;

    /// Forget credentials and cached sessions.
    ///
    /// Never fails, even if the provider was never authenticated.
    async fn sign_out(&self);

    /// Whether the provider currently holds a usable session.
    fn is_authenticated(&self) -> bool;
}
