//! Google Drive API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use cloudsave_common::{Error, Result};

use super::auth::TokenManager;

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Chunk size for resumable uploads (must be a multiple of 256KB).
const CHUNK_SIZE: usize = 4 * 256 * 1024;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents,trashed";

/// Byte stream fed into resumable uploads.
pub type UploadStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// File size in bytes (only for files, not folders).
    #[serde(default)]
    pub size: Option<String>,
    /// Modified time.
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Trashed status.
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Quote a value for use inside a Drive search query.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    /// Create a new Drive client.
    ///
    /// # Errors
    /// - The HTTP client could not be built
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("CloudSave/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    /// Get authorization header.
    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// Create a folder.
    pub async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let auth = self.auth_header().await?;

        let mut metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE
        });

        if let Some(parent) = parent_id {
            metadata["parents"] = serde_json::json!([parent]);
        }

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

        self.handle_response(response).await
    }

    /// List files in a folder, following pagination to the end.
    pub async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        let fields = format!("files({}),nextPageToken", FILE_FIELDS);

        loop {
            let url = format!("{}/files", DRIVE_API_BASE);
            let auth = self.auth_header().await?;

            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", "1000"),
                ]);

            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list folder: {}", e)))?;

            let list_response: FileListResponse = self.handle_response(response).await?;
            all_files.extend(list_response.files);

            match list_response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Find a regular file by name in a folder.
    pub async fn find_file(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType != '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME_TYPE
        );
        self.find_one(&query).await
    }

    /// Find a folder by name below `parent_id` ("root" for the drive root).
    pub async fn find_folder(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME_TYPE
        );
        self.find_one(&query).await
    }

    async fn find_one(&self, query: &str) -> Result<Option<DriveFile>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let auth = self.auth_header().await?;
        let fields = format!("files({})", FILE_FIELDS);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("q", query), ("fields", fields.as_str()), ("pageSize", "1")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to find file: {}", e)))?;

        let list_response: FileListResponse = self.handle_response(response).await?;
        Ok(list_response.files.into_iter().next())
    }

    /// Upload a small file (< 5MB).
    pub async fn upload_simple(
        &self,
        name: &str,
        parent_id: &str,
        data: Vec<u8>,
    ) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id]
        });
        let metadata_json = serde_json::to_string(&metadata)?;

        // Build multipart request
        let boundary = "CloudSaveBoundary";
        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
        body.extend_from_slice(&data);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}--", boundary).as_bytes());

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Replace the content of an existing file.
    pub async fn update_file(&self, file_id: &str, data: Vec<u8>) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_UPLOAD_BASE, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/zip")
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to update file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Start a resumable upload session.
    ///
    /// With `file_id` the session replaces that file's content, otherwise it
    /// creates `name` inside `parent_id`.
    pub async fn start_resumable_upload(
        &self,
        name: &str,
        parent_id: &str,
        file_id: Option<&str>,
        total_size: u64,
    ) -> Result<String> {
        let auth = self.auth_header().await?;

        let request = match file_id {
            Some(id) => self
                .http
                .patch(format!("{}/files/{}", DRIVE_UPLOAD_BASE, id))
                .json(&serde_json::json!({})),
            None => self
                .http
                .post(format!("{}/files", DRIVE_UPLOAD_BASE))
                .json(&serde_json::json!({
                    "name": name,
                    "parents": [parent_id]
                })),
        };

        let response = request
            .header(header::AUTHORIZATION, auth)
            .header("X-Upload-Content-Type", "application/zip")
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start resumable upload: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response, "Failed to start resumable upload").await);
        }

        // Extract upload URI from Location header
        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Network("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Network(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Upload a chunk to a resumable upload session.
    ///
    /// Returns the finished file once the last chunk has been accepted.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: &[u8],
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload chunk: {}", e)))?;

        let status = response.status();

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let file: DriveFile = response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse upload response: {}", e)))?;
            Ok(Some(file))
        } else if status == StatusCode::PERMANENT_REDIRECT {
            // 308 Resume Incomplete
            Ok(None)
        } else {
            Err(Self::status_error(response, "Chunk upload failed").await)
        }
    }

    /// Upload a large file using resumable upload with streaming.
    pub async fn upload_resumable(
        &self,
        name: &str,
        parent_id: &str,
        file_id: Option<&str>,
        mut stream: UploadStream,
        total_size: u64,
    ) -> Result<DriveFile> {
        let upload_uri = self
            .start_resumable_upload(name, parent_id, file_id, total_size)
            .await?;

        let mut bytes_uploaded = 0u64;
        let mut buffer = Vec::with_capacity(CHUNK_SIZE);

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);

            while buffer.len() >= CHUNK_SIZE {
                let chunk_to_upload: Vec<u8> = buffer.drain(..CHUNK_SIZE).collect();
                let result = self
                    .upload_chunk(&upload_uri, &chunk_to_upload, bytes_uploaded, total_size)
                    .await?;

                bytes_uploaded += chunk_to_upload.len() as u64;

                if let Some(file) = result {
                    return Ok(file);
                }
            }
        }

        if !buffer.is_empty() {
            let result = self
                .upload_chunk(&upload_uri, &buffer, bytes_uploaded, total_size)
                .await?;

            if let Some(file) = result {
                return Ok(file);
            }
        }

        Err(Error::Network("Upload did not complete".to_string()))
    }

    /// Stream file content into `dest`, replacing it.
    ///
    /// Returns the number of bytes written.
    pub async fn download_to(&self, file_id: &str, dest: &Path) -> Result<u64> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("File not found: {}", file_id)));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response, "Download failed").await);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Network(format!("Stream read error: {}", e)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    /// Delete a file.
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response, "Delete failed").await)
        }
    }

    async fn status_error(response: reqwest::Response, context: &str) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Error::NotFound(format!("{}: {}", context, body)),
            StatusCode::UNAUTHORIZED => {
                Error::Authentication("Invalid or expired token".to_string())
            }
            StatusCode::FORBIDDEN => Error::Storage(format!("Access denied: {}", body)),
            _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Error::Network(format!("{}: {} - {}", context, status, body))
            }
            _ => Error::Storage(format!("{}: {} - {}", context, status, body)),
        }
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
        } else {
            Err(Self::status_error(response, "API error").await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_file(mime_type: &str, size: Option<&str>) -> DriveFile {
        DriveFile {
            id: "1".to_string(),
            name: "world.zip".to_string(),
            mime_type: mime_type.to_string(),
            size: size.map(str::to_string),
            modified_time: None,
            parents: vec![],
            trashed: false,
        }
    }

    #[test]
    fn test_drive_file_is_folder() {
        assert!(drive_file(FOLDER_MIME_TYPE, None).is_folder());
        assert!(!drive_file("application/zip", Some("10")).is_folder());
    }

    #[test]
    fn test_drive_file_size_bytes() {
        assert_eq!(drive_file("application/zip", Some("12345")).size_bytes(), Some(12345));
        assert_eq!(drive_file(FOLDER_MIME_TYPE, None).size_bytes(), None);
    }

    #[test]
    fn test_list_response_parsing() {
        let json = r#"{
            "files": [
                {"id": "a", "name": "alpha.zip", "mimeType": "application/zip", "size": "42"},
                {"id": "b", "name": "beta.zip", "mimeType": "application/zip"}
            ],
            "nextPageToken": "page-2"
        }"#;

        let response: FileListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.files.len(), 2);
        assert_eq!(response.files[0].size_bytes(), Some(42));
        assert_eq!(response.next_page_token.as_deref(), Some("page-2"));

        let last: FileListResponse = serde_json::from_str(r#"{"files": []}"#).unwrap();
        assert!(last.next_page_token.is_none());
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("Bob's World"), "Bob\\'s World");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }
}
