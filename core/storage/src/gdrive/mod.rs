//! Google Drive storage provider.
//!
//! This module provides a storage backend using Google Drive with:
//! - OAuth2 authentication with automatic token refresh
//! - Tokens persisted below the shared tokens directory
//! - Resumable uploads for large archives
//! - A single backup folder holding every snapshot

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{AuthConfig, AuthManager, TokenManager, TokenStore, Tokens};
pub use client::DriveClient;
pub use provider::{GDriveConfig, GDriveProvider, DEFAULT_FOLDER_NAME};
