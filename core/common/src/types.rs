//! Common types used throughout CloudSave.

use serde::{Deserialize, Serialize};
use std::fmt;

/// File extension of every packed snapshot, without the leading dot.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Normalized name of a storage provider.
///
/// Names are trimmed, lowercased and have whitespace runs replaced by a
/// single underscore, so `"  Drop Box "` and `"drop_box"` are the same
/// provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderName(String);

impl ProviderName {
    /// Normalize a raw provider name.
    ///
    /// # Errors
    /// - Returns error if the name is blank or only separators
    pub fn new(raw: &str) -> crate::Result<Self> {
        Self::normalize(raw).ok_or(crate::Error::EmptyProviderName)
    }

    /// Normalize a raw provider name, returning `None` for input that is
    /// blank or made only of separators.
    pub fn normalize(raw: &str) -> Option<Self> {
        let name = Self(
            raw.split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join("_"),
        );

        if name.lookup_key().is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Get the normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key used for collision checks and lookups.
    ///
    /// Separators are dropped, so `"drop_box"` and `"dropbox"` collide.
    pub fn lookup_key(&self) -> String {
        self.0.chars().filter(|c| *c != '_').collect()
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ProviderName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(&value)
    }
}

impl From<ProviderName> for String {
    fn from(name: ProviderName) -> Self {
        name.0
    }
}

/// Logical name of one backup, e.g. a world name.
///
/// A label maps 1:1 to a remote object named `<label>.zip`, so it may not
/// contain path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotLabel(String);

impl SnapshotLabel {
    /// Create a new label.
    ///
    /// # Errors
    /// - Returns error if the label is blank or contains `/` or `\`
    pub fn new(label: impl Into<String>) -> crate::Result<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Snapshot label cannot be empty".to_string(),
            ));
        }
        if label.contains('/') || label.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "Snapshot label cannot contain path separators: {}",
                label
            )));
        }
        Ok(Self(label))
    }

    /// Recover a label from a remote object name.
    ///
    /// Returns `None` if the name does not carry the archive extension.
    pub fn from_remote_name(remote_name: &str) -> Option<Self> {
        let stem = remote_name.strip_suffix(&format!(".{}", ARCHIVE_EXTENSION))?;
        Self::new(stem).ok()
    }

    /// Get the label as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the remote object holding this snapshot.
    pub fn remote_name(&self) -> String {
        format!("{}.{}", self.0, ARCHIVE_EXTENSION)
    }

    /// Filesystem-friendly prefix for local temporary artifacts.
    pub fn file_stem(&self) -> String {
        self.0.to_lowercase().replace(' ', "_")
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
