//! Snapshot archiving for CloudSave.
//!
//! Turns a directory tree into a single zip artifact and back. Entry names
//! are relative paths, so an artifact is restorable on its own.

pub mod archiver;

pub use archiver::{ArtifactKind, Archiver};
