//! Local media library access.
//!
//! The device library is modelled as a directory of files named
//! `{asset_id}.{ext}`; the extension decides whether the asset is a photo or a
//! video.
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::model::MediaKind;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("asset {0} not found in local library")]
    NotFound(String),
    #[error("asset {id} cannot be read: {reason}")]
    Unsupported { id: String, reason: &'static str },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub id: String,
    pub media_kind: MediaKind,
    pub path: PathBuf,
}

/// Read-only access to the device media library.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn get_asset(&self, id: &str) -> Result<LocalAsset, MediaError>;

    /// Full-quality encoded image bytes.
    async fn request_image_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError>;

    /// Full-quality encoded video bytes.
    async fn request_video_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError>;
}

const PHOTO_EXTENSIONS: &[&str] = &["jpeg", "jpg", "heic", "png"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];

#[derive(Debug, Clone)]
pub struct DirectoryMediaLibrary {
    root: PathBuf,
}

impl DirectoryMediaLibrary {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn candidates(&self, id: &str) -> impl Iterator<Item = (PathBuf, MediaKind)> + '_ {
        let photos = PHOTO_EXTENSIONS.iter().map(|e| (*e, MediaKind::Photo));
        let videos = VIDEO_EXTENSIONS.iter().map(|e| (*e, MediaKind::Video));
        let id = id.to_string();
        photos
            .chain(videos)
            .map(move |(ext, kind)| (self.root.join(format!("{}.{}", id, ext)), kind))
    }
}

fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && id != "." && id != ".."
}

#[async_trait]
impl MediaLibrary for DirectoryMediaLibrary {
    async fn get_asset(&self, id: &str) -> Result<LocalAsset, MediaError> {
        if !is_plain_id(id) {
            return Err(MediaError::NotFound(id.to_string()));
        }
        for (path, media_kind) in self.candidates(id) {
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(LocalAsset {
                    id: id.to_string(),
                    media_kind,
                    path,
                });
            }
        }
        Err(MediaError::NotFound(id.to_string()))
    }

    async fn request_image_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError> {
        if asset.media_kind != MediaKind::Photo {
            return Err(MediaError::Unsupported {
                id: asset.id.clone(),
                reason: "not an image",
            });
        }
        read_asset(asset).await
    }

    async fn request_video_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError> {
        if asset.media_kind != MediaKind::Video {
            return Err(MediaError::Unsupported {
                id: asset.id.clone(),
                reason: "not a video",
            });
        }
        read_asset(asset).await
    }
}

async fn read_asset(asset: &LocalAsset) -> Result<Vec<u8>, MediaError> {
    match fs::read(&asset.path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(MediaError::NotFound(asset.id.clone()))
        }
        Err(err) => Err(err.into()),
    }
}
