#![allow(dead_code)]

use async_trait::async_trait;
use polog_sync::db;
use polog_sync::gateway::{GatewayError, GroupAsset, PologInput, PublicationGateway, RemotePolog, RemoteRoute};
use polog_sync::media::{LocalAsset, MediaError, MediaLibrary};
use polog_sync::model::{AssetRef, MediaKind, PologContent, PologDraft, RouteEntry, StagingEntry};
use polog_sync::registrar::Services;
use polog_sync::storage::{BlobStore, StoragePath, UploadError};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn services(
    gateway: &RecordingGateway,
    blobs: &RecordingBlobs,
    media: &RecordingMedia,
) -> Services {
    Services {
        gateway: Arc::new(gateway.clone()),
        blobs: Arc::new(blobs.clone()),
        media: Arc::new(media.clone()),
        request_timeout: Duration::from_secs(2),
    }
}

/// Journal content with one photo route per asset id, all local.
pub fn polog(title: &str, assets: &[&str]) -> PologContent {
    let mut content = PologContent::new(title);
    let id = content.id.clone();
    content.routes = assets
        .iter()
        .map(|a| RouteEntry::new(&id, AssetRef::local(*a), MediaKind::Photo))
        .collect();
    content
}

/// Author a draft and commit it, the way the app does.
pub async fn stage(pool: &sqlx::SqlitePool, content: PologContent) -> StagingEntry {
    let draft = PologDraft::new(content);
    db::save_draft(pool, &draft).await.unwrap();
    db::commit_draft(pool, draft.id()).await.unwrap()
}

pub async fn staged(pool: &sqlx::SqlitePool, id: &str) -> Option<StagingEntry> {
    db::fetch_staging(pool, id).await.unwrap()
}

// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingGateway {
    remote: Arc<Mutex<HashMap<String, RemotePolog>>>,
    group_assets: Arc<Mutex<HashMap<String, GroupAsset>>>,
    downloads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fetch_failures: Arc<Mutex<HashMap<String, fn() -> GatewayError>>>,
    mutation_responses: Arc<Mutex<VecDeque<Result<(), GatewayError>>>>,
    fetch_delay: Arc<Mutex<Option<Duration>>>,
    pub fetch_calls: Arc<Mutex<Vec<String>>>,
    pub create_calls: Arc<Mutex<Vec<PologInput>>>,
    pub update_calls: Arc<Mutex<Vec<PologInput>>>,
    pub download_calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl RecordingGateway {
    pub fn with_remote(self, remote: RemotePolog) -> Self {
        self.remote.lock().unwrap().insert(remote.id.clone(), remote);
        self
    }

    pub fn with_group_asset(self, id: &str, kind: MediaKind, bytes: &[u8]) -> Self {
        let url = format!("https://signed.test/{}", id);
        self.group_assets.lock().unwrap().insert(
            id.to_string(),
            GroupAsset {
                id: id.to_string(),
                url: url.clone(),
                media_kind: kind,
            },
        );
        self.downloads.lock().unwrap().insert(url, bytes.to_vec());
        self
    }

    pub fn fail_fetch(&self, id: &str, err: fn() -> GatewayError) {
        self.fetch_failures.lock().unwrap().insert(id.to_string(), err);
    }

    pub fn clear_fetch_failures(&self) {
        self.fetch_failures.lock().unwrap().clear();
    }

    pub fn push_mutation_response(&self, res: Result<(), GatewayError>) {
        self.mutation_responses.lock().unwrap().push_back(res);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_calls(&self) -> Vec<String> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> Vec<PologInput> {
        self.create_calls.lock().unwrap().clone()
    }

    pub fn update_calls(&self) -> Vec<PologInput> {
        self.update_calls.lock().unwrap().clone()
    }

    pub fn download_calls(&self) -> Vec<String> {
        self.download_calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn mutate(&self, input: &PologInput) -> Result<RemotePolog, GatewayError> {
        if let Some(res) = self.mutation_responses.lock().unwrap().pop_front() {
            res?;
        }
        let remote = RemotePolog {
            id: input.id.clone(),
            thumbnail_url: input.thumbnail_url.clone(),
            routes: input
                .routes
                .iter()
                .map(|r| RemoteRoute {
                    id: r.id.clone(),
                    asset_url: r.asset_url.clone(),
                })
                .collect(),
        };
        self.remote
            .lock()
            .unwrap()
            .insert(remote.id.clone(), remote.clone());
        Ok(remote)
    }
}

#[async_trait]
impl PublicationGateway for RecordingGateway {
    async fn fetch_polog(&self, id: &str) -> Result<RemotePolog, GatewayError> {
        self.fetch_calls.lock().unwrap().push(id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self.fetch_failures.lock().unwrap().get(id).copied();
        if let Some(make_err) = failure {
            return Err(make_err());
        }
        self.remote
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn fetch_group_asset(&self, id: &str) -> Result<GroupAsset, GatewayError> {
        self.group_assets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn create_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError> {
        self.create_calls.lock().unwrap().push(input.clone());
        self.mutate(input)
    }

    async fn update_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError> {
        self.update_calls.lock().unwrap().push(input.clone());
        self.mutate(input)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        self.download_calls.lock().unwrap().push(url.to_string());
        self.downloads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCall {
    pub path: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Clone, Default)]
pub struct RecordingBlobs {
    uploads: Arc<Mutex<Vec<UploadCall>>>,
    /// Number of uploads that succeed before every further one fails.
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl RecordingBlobs {
    pub fn fail_after(&self, successes: usize) {
        *self.fail_after.lock().unwrap() = Some(successes);
    }

    pub fn recover(&self) {
        *self.fail_after.lock().unwrap() = None;
    }

    pub fn uploads(&self) -> Vec<UploadCall> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn url_for(path: &str) -> String {
        format!("https://cdn.test/{}", path)
    }
}

#[async_trait]
impl BlobStore for RecordingBlobs {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        path: &StoragePath,
    ) -> Result<String, UploadError> {
        let mut uploads = self.uploads.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if uploads.len() >= limit {
                return Err(UploadError::Failed("connection reset".into()));
            }
        }
        uploads.push(UploadCall {
            path: path.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
        });
        Ok(Self::url_for(&path.to_string()))
    }
}

// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingMedia {
    assets: Arc<Mutex<HashMap<String, (MediaKind, Vec<u8>)>>>,
    pub image_calls: Arc<AtomicUsize>,
    pub video_calls: Arc<AtomicUsize>,
}

impl RecordingMedia {
    pub fn with_asset(self, id: &str, kind: MediaKind, bytes: &[u8]) -> Self {
        self.assets
            .lock()
            .unwrap()
            .insert(id.to_string(), (kind, bytes.to_vec()));
        self
    }

    pub fn with_photos(self, ids: &[&str]) -> Self {
        ids.iter()
            .fold(self, |media, id| media.with_asset(id, MediaKind::Photo, b"jpeg"))
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn video_calls(&self) -> usize {
        self.video_calls.load(Ordering::SeqCst)
    }

    fn bytes(&self, id: &str) -> Result<Vec<u8>, MediaError> {
        self.assets
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| MediaError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl MediaLibrary for RecordingMedia {
    async fn get_asset(&self, id: &str) -> Result<LocalAsset, MediaError> {
        let kind = self
            .assets
            .lock()
            .unwrap()
            .get(id)
            .map(|(k, _)| *k)
            .ok_or_else(|| MediaError::NotFound(id.to_string()))?;
        Ok(LocalAsset {
            id: id.to_string(),
            media_kind: kind,
            path: PathBuf::from(id),
        })
    }

    async fn request_image_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.bytes(&asset.id)
    }

    async fn request_video_data(&self, asset: &LocalAsset) -> Result<Vec<u8>, MediaError> {
        self.video_calls.fetch_add(1, Ordering::SeqCst);
        self.bytes(&asset.id)
    }
}
