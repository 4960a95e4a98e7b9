//! Blob storage for uploaded media.
//!
//! Objects live under `userData/{folder}/{file}.{ext}`.
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::model::MediaKind;

const USER_DATA_ROOT: &str = "userData";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload failed: {0}")]
    Failed(String),
    #[error("invalid object name: {0:?}")]
    InvalidName(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFolder {
    PologRoutes,
    PologThumbnails,
    UserIcons,
    GroupIcons,
    GroupAlbumCovers,
    GroupAlbumAssets,
}

impl StorageFolder {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFolder::PologRoutes => "pologRoutes",
            StorageFolder::PologThumbnails => "pologThumbnails",
            StorageFolder::UserIcons => "userIcons",
            StorageFolder::GroupIcons => "groupIcons",
            StorageFolder::GroupAlbumCovers => "groupAlbumCovers",
            StorageFolder::GroupAlbumAssets => "groupAlbumAssets",
        }
    }
}

/// Deterministic object path; the same record always maps to the same path so
/// a retried upload overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePath {
    folder: StorageFolder,
    name: String,
    kind: MediaKind,
}

impl StoragePath {
    /// Fails when `name` could leave its folder once joined onto the base URL.
    pub fn new(
        folder: StorageFolder,
        name: impl Into<String>,
        kind: MediaKind,
    ) -> Result<Self, UploadError> {
        let name = name.into();
        Self::validate_name(&name)?;
        Ok(Self { folder, name, kind })
    }

    pub fn route(route_id: &str, kind: MediaKind) -> Result<Self, UploadError> {
        Self::new(StorageFolder::PologRoutes, route_id, kind)
    }

    pub fn thumbnail(polog_id: &str) -> Result<Self, UploadError> {
        Self::new(StorageFolder::PologThumbnails, polog_id, MediaKind::Photo)
    }

    /// Object names are a single URL path segment: no separators, no
    /// percent escapes, no query or fragment markers.
    pub fn validate_name(name: &str) -> Result<(), UploadError> {
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name
                .chars()
                .any(|c| matches!(c, '/' | '\\' | '%' | '?' | '#') || c.is_control());
        if plain {
            Ok(())
        } else {
            Err(UploadError::InvalidName(name.to_string()))
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.kind.content_type()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}",
            USER_DATA_ROOT,
            self.folder.as_str(),
            self.name,
            self.kind.extension()
        )
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `bytes` and return a stable reference URL.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        path: &StoragePath,
    ) -> Result<String, UploadError>;
}

#[derive(Clone)]
pub struct HttpBlobStore {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBlobStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    download_url: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self, UploadError> {
        let http = Client::builder()
            .user_agent("polog-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn object_url(&self, path: &StoragePath) -> Result<Url, UploadError> {
        self.base_url
            .join(&path.to_string())
            .map_err(|e| UploadError::Failed(format!("invalid object path {}: {}", path, e)))
    }

    pub fn build_request(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        path: &StoragePath,
    ) -> Result<reqwest::Request, UploadError> {
        Ok(self
            .http
            .put(self.object_url(path)?)
            .bearer_auth(&self.token)
            .header("Content-Type", content_type)
            .body(bytes)
            .build()?)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        path: &StoragePath,
    ) -> Result<String, UploadError> {
        let size = bytes.len();
        let request = self.build_request(bytes, content_type, path)?;
        let url = request.url().clone();
        debug!(%url, size, content_type, "uploading blob");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UploadError::Failed(format!("http {}: {}", status, body)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(url.to_string());
        }
        let body = res.text().await.unwrap_or_default();
        let download_url = serde_json::from_str::<UploadResponse>(&body)
            .ok()
            .and_then(|r| r.download_url)
            .filter(|u| !u.is_empty());
        Ok(download_url.unwrap_or_else(|| url.to_string()))
    }
}
