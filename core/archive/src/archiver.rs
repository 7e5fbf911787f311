//! Directory tree <-> single zip artifact.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use cloudsave_common::{Error, Result, SnapshotLabel, ARCHIVE_EXTENSION};

/// Purpose of a local temporary artifact, reflected in its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Packed snapshot about to be uploaded.
    Backup,
    /// Remote snapshot downloaded for extraction.
    Download,
}

impl ArtifactKind {
    fn tag(self) -> &'static str {
        match self {
            ArtifactKind::Backup => "backup",
            ArtifactKind::Download => "download",
        }
    }
}

/// Packs directory trees into zip artifacts and extracts them again.
///
/// Entry names are the file paths relative to the packed directory, joined
/// with `/`, so an artifact can be restored without extra metadata.
#[derive(Debug, Clone)]
pub struct Archiver {
    temp_dir: PathBuf,
    compression: CompressionMethod,
}

impl Archiver {
    /// Create an archiver writing artifacts into the OS temp directory.
    pub fn new() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            compression: CompressionMethod::Deflated,
        }
    }

    /// Write artifacts into `dir` instead of the OS temp directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Store entries without compression.
    pub fn stored(mut self) -> Self {
        self.compression = CompressionMethod::Stored;
        self
    }

    /// Directory where temporary artifacts are created.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Create an empty, uniquely named artifact file for `label`.
    ///
    /// The name follows `<label stem>_<kind>_<unique>.zip`.
    pub fn create_artifact(&self, label: &SnapshotLabel, kind: ArtifactKind) -> Result<(PathBuf, File)> {
        fs::create_dir_all(&self.temp_dir)?;

        let file_name = format!(
            "{}_{}_{}.{}",
            label.file_stem(),
            kind.tag(),
            Uuid::new_v4().simple(),
            ARCHIVE_EXTENSION
        );
        let path = self.temp_dir.join(file_name);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        Ok((path, file))
    }

    /// Pack every regular file below `source_dir` into a new artifact.
    ///
    /// # Postconditions
    /// - Returns the path of a complete artifact owned by the caller
    ///
    /// # Errors
    /// - Source directory missing or unreadable
    /// - Any file unreadable; the partial artifact is removed
    pub fn pack(&self, source_dir: &Path, label: &SnapshotLabel) -> Result<PathBuf> {
        if !source_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Source directory not found: {}",
                source_dir.display()
            )));
        }

        let (artifact, file) = self.create_artifact(label, ArtifactKind::Backup)?;

        match self.write_archive(source_dir, &artifact, file) {
            Ok(entries) => {
                debug!(label = %label, entries, "Packed {}", source_dir.display());
                Ok(artifact)
            }
            Err(err) => {
                if let Err(cleanup_err) = fs::remove_file(&artifact) {
                    warn!("Failed to remove partial artifact {}: {}", artifact.display(), cleanup_err);
                }
                Err(err)
            }
        }
    }

    fn write_archive(&self, source_dir: &Path, artifact: &Path, file: File) -> Result<usize> {
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let mut entries = 0;

        for entry in WalkDir::new(source_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                Error::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop while walking source")),
                )
            })?;

            if !entry.file_type().is_file() || entry.path() == artifact {
                continue;
            }

            let name = entry_name(source_dir, entry.path())?;
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let options = SimpleFileOptions::default()
                .compression_method(self.compression)
                .large_file(size >= u32::MAX as u64);

            let mut source = File::open(entry.path())?;
            zip.start_file(name.as_str(), options)
                .map_err(|e| Error::Archive(format!("Failed to start entry {}: {}", name, e)))?;
            io::copy(&mut source, &mut zip)?;
            entries += 1;
        }

        let mut writer = zip
            .finish()
            .map_err(|e| Error::Archive(format!("Failed to finalize archive: {}", e)))?;
        writer.flush()?;

        Ok(entries)
    }

    /// Extract an artifact into `target_dir`, overwriting existing files.
    ///
    /// Extraction is not atomic: entries written before a failure stay on
    /// disk.
    ///
    /// # Errors
    /// - Artifact unreadable or not a zip archive
    /// - Entry name escapes `target_dir`
    /// - Any entry write fails
    pub fn unpack(&self, artifact: &Path, target_dir: &Path) -> Result<usize> {
        fs::create_dir_all(target_dir)?;

        let mut archive = ZipArchive::new(File::open(artifact)?)
            .map_err(|e| Error::Archive(format!("Invalid archive {}: {}", artifact.display(), e)))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| Error::Archive(format!("Failed to read entry {}: {}", index, e)))?;

            let relative = entry.enclosed_name().ok_or_else(|| {
                Error::Archive(format!("Refusing to extract unsafe entry: {}", entry.name()))
            })?;
            let destination = target_dir.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&destination)?;
                continue;
            }

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut output = File::create(&destination)?;
            io::copy(&mut entry, &mut output)?;
        }

        debug!("Extracted {} entries into {}", archive.len(), target_dir.display());

        Ok(archive.len())
    }
}

impl Default for Archiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry name for `path`: its components relative to `root`, joined by `/`.
///
/// Names that are not valid UTF-8 are rejected rather than mangled, since
/// two such names could collapse onto one entry.
fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::Archive(format!("{} is outside {}", path.display(), root.display()))
    })?;

    let components = relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                Error::Archive(format!("File name is not valid UTF-8: {}", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(components.join("/"))
}
