//! Background publication of staged journal entries.
//!
//! A cycle walks every staging entry in order: finished entries are deleted,
//! pending ones are reconciled against the remote service, their missing route
//! assets and thumbnail are uploaded (persisting after every upload), and the
//! entry is created or updated remotely. The first unexpected error aborts the
//! rest of the cycle; the next tick starts over from the store.
//!
//! A pass holds a lease row in the store for its whole duration, so passes
//! from different processes sharing one database never overlap. Bookkeeping
//! writes are conditional on the staging revision read at the start of the
//! pass: an entry re-committed mid-pass is left pending for the next one.
use crate::db::{self, Pool};
use crate::gateway::{build_polog_input, GatewayError, PublicationGateway, RemotePolog};
use crate::media::{MediaError, MediaLibrary};
use crate::model::{AssetRef, AssetSource, MediaKind, PologContent, PublishedPolog, StagingEntry};
use crate::storage::{BlobStore, StoragePath, UploadError};
use anyhow::{bail, Result};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Role an asset plays in the entry being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    Route,
    Thumbnail,
}

impl fmt::Display for AssetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetRole::Route => f.write_str("route"),
            AssetRole::Thumbnail => f.write_str("thumbnail"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    /// The asset already lives in the target store and can never be uploaded.
    #[error("asset {asset_id} ({asset_source}) is not a valid {role} upload source")]
    InvalidAssetSource {
        asset_id: String,
        asset_source: AssetSource,
        role: AssetRole,
    },
    #[error("polog {polog_id} keeps its remote thumbnail but the remote entry has none")]
    MissingRemoteThumbnail { polog_id: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Collaborators used by a registration cycle.
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn PublicationGateway>,
    pub blobs: Arc<dyn BlobStore>,
    pub media: Arc<dyn MediaLibrary>,
    /// Upper bound for every single collaborator call.
    pub request_timeout: Duration,
}

/// What a completed cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterReport {
    pub deleted: usize,
    pub skipped: usize,
    pub published: usize,
    pub uploaded: usize,
    /// Entries re-committed while this pass worked on them.
    pub superseded: usize,
    /// Another pass held the store lease; nothing was done.
    pub contended: bool,
}

/// Lease row name shared by every pass against one store.
pub const REGISTER_LEASE: &str = "register";

/// Store-level lease held for one pass.
struct PassLease<'a> {
    pool: &'a Pool,
    holder: String,
    ttl: Duration,
}

impl<'a> PassLease<'a> {
    /// Between two renewals a pass makes at most three collaborator calls,
    /// each bounded by the request timeout.
    fn ttl_for(request_timeout: Duration) -> Duration {
        request_timeout * 4
    }

    async fn acquire(pool: &'a Pool, request_timeout: Duration) -> Result<Option<PassLease<'a>>> {
        let lease = PassLease {
            pool,
            holder: Uuid::new_v4().to_string(),
            ttl: Self::ttl_for(request_timeout),
        };
        let acquired =
            db::try_acquire_lease(pool, REGISTER_LEASE, &lease.holder, lease.ttl).await?;
        Ok(acquired.then_some(lease))
    }

    async fn renew(&self) -> Result<()> {
        if !db::try_acquire_lease(self.pool, REGISTER_LEASE, &self.holder, self.ttl).await? {
            bail!("registrar lease lost to another pass");
        }
        Ok(())
    }

    async fn release(self) {
        if let Err(err) = db::release_lease(self.pool, REGISTER_LEASE, &self.holder).await {
            warn!(?err, "failed to release registrar lease");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Published { uploaded: usize },
    Superseded,
}

/// Write bookkeeping and extend the lease. `false` means the entry was
/// re-committed since this pass read it.
async fn checkpoint(lease: &PassLease<'_>, entry: &StagingEntry) -> Result<bool> {
    if !db::checkpoint_staging(lease.pool, entry).await? {
        info!(staging_id = %entry.id, "entry re-committed during registration; leaving it for the next pass");
        return Ok(false);
    }
    lease.renew().await?;
    Ok(true)
}

async fn timed<T, E, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, RegisterError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<RegisterError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(RegisterError::Timeout {
            operation,
            after: limit,
        }),
    }
}

fn invalid_source(asset: &AssetRef, role: AssetRole) -> RegisterError {
    RegisterError::InvalidAssetSource {
        asset_id: asset.id.clone(),
        asset_source: asset.source,
        role,
    }
}

fn ensure_uploadable(asset: &AssetRef, role: AssetRole) -> Result<(), RegisterError> {
    match asset.source {
        AssetSource::Local | AssetSource::GroupAsset => Ok(()),
        AssetSource::PologThumbnail | AssetSource::PologRouteAsset => {
            Err(invalid_source(asset, role))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ThumbnailPlan {
    Absent,
    Reuse(String),
    Upload(AssetRef),
}

fn plan_thumbnail(
    polog: &PologContent,
    entry: &StagingEntry,
    current: Option<&RemotePolog>,
) -> Result<ThumbnailPlan, RegisterError> {
    let Some(asset) = polog.thumbnail.as_ref() else {
        return Ok(ThumbnailPlan::Absent);
    };
    match asset.source {
        AssetSource::Local | AssetSource::GroupAsset => Ok(match &entry.thumbnail_url {
            Some(url) => ThumbnailPlan::Reuse(url.clone()),
            None => ThumbnailPlan::Upload(asset.clone()),
        }),
        AssetSource::PologThumbnail => current
            .and_then(|c| c.thumbnail_url.clone())
            .map(ThumbnailPlan::Reuse)
            .ok_or_else(|| RegisterError::MissingRemoteThumbnail {
                polog_id: polog.id.clone(),
            }),
        AssetSource::PologRouteAsset => Err(invalid_source(asset, AssetRole::Thumbnail)),
    }
}

/// Resolve the bytes behind an uploadable asset.
async fn fetch_source(
    services: &Services,
    asset: &AssetRef,
    role: AssetRole,
) -> Result<(Vec<u8>, MediaKind), RegisterError> {
    let limit = services.request_timeout;
    match asset.source {
        AssetSource::Local => {
            let local = timed(limit, "local asset lookup", services.media.get_asset(&asset.id)).await?;
            let bytes = match (role, local.media_kind) {
                (AssetRole::Thumbnail, _) | (AssetRole::Route, MediaKind::Photo) => {
                    timed(limit, "image data fetch", services.media.request_image_data(&local)).await?
                }
                (AssetRole::Route, MediaKind::Video) => {
                    timed(limit, "video data fetch", services.media.request_video_data(&local)).await?
                }
            };
            let kind = match role {
                AssetRole::Thumbnail => MediaKind::Photo,
                AssetRole::Route => local.media_kind,
            };
            Ok((bytes, kind))
        }
        AssetSource::GroupAsset => {
            let remote = timed(
                limit,
                "group asset lookup",
                services.gateway.fetch_group_asset(&asset.id),
            )
            .await?;
            if role == AssetRole::Thumbnail && remote.media_kind != MediaKind::Photo {
                return Err(MediaError::Unsupported {
                    id: asset.id.clone(),
                    reason: "thumbnail must be an image",
                }
                .into());
            }
            let bytes = timed(limit, "group asset download", services.gateway.download(&remote.url)).await?;
            Ok((bytes, remote.media_kind))
        }
        AssetSource::PologThumbnail | AssetSource::PologRouteAsset => {
            Err(invalid_source(asset, role))
        }
    }
}

/// Publish one pending entry.
///
/// Uploads made before a re-commit is noticed are not recorded; the next pass
/// uploads them again to the same object paths.
#[instrument(skip_all, fields(polog_id = %polog.id))]
async fn register_entry(
    lease: &PassLease<'_>,
    services: &Services,
    mut entry: StagingEntry,
    polog: PologContent,
) -> Result<EntryOutcome> {
    let pool = lease.pool;
    let limit = services.request_timeout;

    let current = match timed(limit, "polog query", services.gateway.fetch_polog(&polog.id)).await {
        Ok(remote) => Some(remote),
        Err(RegisterError::Gateway(GatewayError::NotFound)) => {
            debug!("polog not found remotely; creating");
            None
        }
        Err(err) => return Err(err.into()),
    };

    let resolved: Vec<Option<String>> = polog
        .routes
        .iter()
        .map(|route| {
            entry
                .uploaded_url(&route.id)
                .or_else(|| current.as_ref().and_then(|c| c.route_url(&route.id)))
                .map(str::to_string)
        })
        .collect();

    entry.total_upload_count = resolved.iter().filter(|u| u.is_some()).count() as i64;
    if !checkpoint(lease, &entry).await? {
        return Ok(EntryOutcome::Superseded);
    }

    // Reject impossible sources and object names before touching the blob store.
    for (route, url) in polog.routes.iter().zip(&resolved) {
        if url.is_none() {
            ensure_uploadable(&route.asset, AssetRole::Route)?;
            StoragePath::validate_name(&route.id).map_err(RegisterError::from)?;
        }
    }
    let thumbnail_plan = plan_thumbnail(&polog, &entry, current.as_ref())?;
    if let ThumbnailPlan::Upload(_) = thumbnail_plan {
        StoragePath::validate_name(&polog.id).map_err(RegisterError::from)?;
    }

    let mut uploaded = 0;
    let mut route_urls = Vec::with_capacity(polog.routes.len());
    for (route, url) in polog.routes.iter().zip(resolved) {
        let url = match url {
            Some(url) => url,
            None => {
                let (bytes, kind) = fetch_source(services, &route.asset, AssetRole::Route).await?;
                if kind != route.media_kind {
                    warn!(route_id = %route.id, ?kind, expected = ?route.media_kind, "media kind differs from draft");
                }
                let path = StoragePath::route(&route.id, kind).map_err(RegisterError::from)?;
                let url = timed(
                    limit,
                    "route asset upload",
                    services.blobs.upload(bytes, path.content_type(), &path),
                )
                .await?;
                entry.record_upload(&route.id, &url);
                entry.total_upload_count += 1;
                uploaded += 1;
                if !checkpoint(lease, &entry).await? {
                    return Ok(EntryOutcome::Superseded);
                }
                info!(route_id = %route.id, %path, "route asset uploaded");
                url
            }
        };
        route_urls.push(url);
    }

    let thumbnail_url = match thumbnail_plan {
        ThumbnailPlan::Absent => None,
        ThumbnailPlan::Reuse(url) => Some(url),
        ThumbnailPlan::Upload(asset) => {
            let (bytes, _) = fetch_source(services, &asset, AssetRole::Thumbnail).await?;
            let path = StoragePath::thumbnail(&polog.id).map_err(RegisterError::from)?;
            let url = timed(
                limit,
                "thumbnail upload",
                services.blobs.upload(bytes, path.content_type(), &path),
            )
            .await?;
            entry.thumbnail_url = Some(url.clone());
            uploaded += 1;
            if !checkpoint(lease, &entry).await? {
                return Ok(EntryOutcome::Superseded);
            }
            info!(%path, "thumbnail uploaded");
            Some(url)
        }
    };

    let input = build_polog_input(&polog, &route_urls, thumbnail_url);
    let result = match current {
        Some(_) => timed(limit, "polog update", services.gateway.update_polog(&input)).await,
        None => timed(limit, "polog create", services.gateway.create_polog(&input)).await,
    };
    let remote = match result {
        Ok(remote) => Some(remote),
        Err(RegisterError::Gateway(GatewayError::AlreadyExists)) => {
            info!("polog already exists remotely; treating as published");
            None
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(remote) = remote {
        let published = PublishedPolog {
            id: remote.id.clone(),
            thumbnail_url: remote.thumbnail_url.clone(),
            routes: remote.uploaded_routes(),
            published_at: Utc::now(),
        };
        if let Err(err) = db::record_published(pool, &published).await {
            warn!(?err, "failed to cache published polog");
        }
    }

    entry.finished_at = Some(Utc::now());
    entry.last_error = None;
    if !db::checkpoint_staging(pool, &entry).await? {
        info!("entry re-committed while publishing; newer content stays pending");
        return Ok(EntryOutcome::Superseded);
    }
    info!(routes = route_urls.len(), uploaded, "polog published");

    Ok(EntryOutcome::Published { uploaded })
}

/// Run one full pass over the staging store.
///
/// Returns a `contended` report without touching anything when another pass,
/// in this or another process, holds the store lease.
#[instrument(skip_all)]
pub async fn register(pool: &Pool, services: &Services) -> Result<RegisterReport> {
    let Some(lease) = PassLease::acquire(pool, services.request_timeout).await? else {
        debug!("another registration pass holds the store lease; skipping");
        return Ok(RegisterReport {
            contended: true,
            ..RegisterReport::default()
        });
    };
    let result = register_with_lease(&lease, services).await;
    lease.release().await;
    result
}

async fn register_with_lease(lease: &PassLease<'_>, services: &Services) -> Result<RegisterReport> {
    let pool = lease.pool;
    let mut report = RegisterReport::default();
    let entries = db::fetch_all_staging(pool).await?;
    debug!(entries = entries.len(), "registration cycle started");

    for entry in entries {
        lease.renew().await?;
        if entry.is_finished() {
            if db::delete_finished_staging(pool, &entry.id, entry.revision).await? {
                debug!(staging_id = %entry.id, "deleted finished staging entry");
                report.deleted += 1;
            } else {
                debug!(staging_id = %entry.id, "finished entry was re-committed; keeping it");
            }
            continue;
        }
        let Some(polog) = entry.polog.clone() else {
            warn!(staging_id = %entry.id, "staging entry has no payload; skipping");
            report.skipped += 1;
            continue;
        };

        let id = entry.id.clone();
        match register_entry(lease, services, entry, polog).await {
            Ok(EntryOutcome::Published { uploaded }) => {
                report.published += 1;
                report.uploaded += uploaded;
            }
            Ok(EntryOutcome::Superseded) => report.superseded += 1,
            Err(err) => {
                if let Err(record_err) =
                    db::record_staging_error(pool, &id, &format!("{:#}", err)).await
                {
                    warn!(?record_err, staging_id = %id, "failed to record staging error");
                }
                return Err(err.context(format!("failed to register polog {}", id)));
            }
        }
    }

    Ok(report)
}

struct Shared {
    pool: Pool,
    services: Services,
    interval: Duration,
    cycle: tokio::sync::Mutex<()>,
    active_loops: AtomicUsize,
}

impl Shared {
    /// One cycle; never overlaps with another.
    async fn run_cycle(&self) -> Result<RegisterReport> {
        let _guard = self.cycle.lock().await;
        register(&self.pool, &self.services).await
    }
}

struct LoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    fn is_live(&self) -> bool {
        !*self.stop.borrow() && !self.task.is_finished()
    }
}

struct ActiveLoop<'a>(&'a AtomicUsize);

impl<'a> ActiveLoop<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveLoop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the recurring registration loop.
pub struct Registrar {
    shared: Arc<Shared>,
    handle: Mutex<Option<LoopHandle>>,
}

impl Registrar {
    pub fn new(pool: Pool, services: Services, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                services,
                interval,
                cycle: tokio::sync::Mutex::new(()),
                active_loops: AtomicUsize::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the recurring loop. No-op while a loop is already running.
    pub fn start(&self) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(LoopHandle::is_live) {
            debug!("registrar already running");
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_loop(shared, stop_rx));
        info!(interval = ?self.shared.interval, "registrar started");
        *slot = Some(LoopHandle { stop, task });
    }

    /// Ask the loop to exit. An in-flight cycle always runs to completion.
    pub fn stop(&self) {
        let slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.as_ref() {
            let _ = handle.stop.send(true);
            info!("registrar stop requested");
        }
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(&self) {
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            if let Err(err) = handle.task.await {
                error!(?err, "registrar loop panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(LoopHandle::is_live)
    }

    /// Number of loop tasks currently alive (including ones winding down).
    pub fn active_loops(&self) -> usize {
        self.shared.active_loops.load(Ordering::SeqCst)
    }

    /// Run a single cycle now, serialized with the loop.
    pub async fn run_once(&self) -> Result<RegisterReport> {
        self.shared.run_cycle().await
    }
}

async fn run_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let _active = ActiveLoop::enter(&shared.active_loops);
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop.borrow() {
            break;
        }

        match shared.run_cycle().await {
            Ok(report) => debug!(?report, "registration cycle finished"),
            Err(err) => error!(?err, "registration cycle aborted"),
        }
    }
    info!("registrar stopped");
}
