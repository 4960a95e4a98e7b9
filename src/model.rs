use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Where the bytes behind an [`AssetRef`] live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    /// Device media library.
    Local,
    /// Asset owned by a group album on the remote service.
    GroupAsset,
    /// Already hosted as a journal thumbnail.
    PologThumbnail,
    /// Already hosted as a journal route asset.
    PologRouteAsset,
}

impl AssetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSource::Local => "local",
            AssetSource::GroupAsset => "group_asset",
            AssetSource::PologThumbnail => "polog_thumbnail",
            AssetSource::PologRouteAsset => "polog_route_asset",
        }
    }
}

impl fmt::Display for AssetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRef {
    pub id: String,
    pub source: AssetSource,
}

impl AssetRef {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: AssetSource::Local,
        }
    }

    pub fn group_asset(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: AssetSource::GroupAsset,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            MediaKind::Photo => "image/jpeg",
            MediaKind::Video => "video/mp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpeg",
            MediaKind::Video => "mp4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "PHOTO",
            MediaKind::Video => "VIDEO",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PHOTO" | "IMAGE" => Some(MediaKind::Photo),
            "VIDEO" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Transportation {
    Walk,
    Bicycle,
    Car,
    Bus,
    Train,
    Subway,
    Airplane,
    Ship,
    Other,
}

impl Transportation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transportation::Walk => "WALK",
            Transportation::Bicycle => "BICYCLE",
            Transportation::Car => "CAR",
            Transportation::Bus => "BUS",
            Transportation::Train => "TRAIN",
            Transportation::Subway => "SUBWAY",
            Transportation::Airplane => "AIRPLANE",
            Transportation::Ship => "SHIP",
            Transportation::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Followers,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Followers => "FOLLOWERS",
            Visibility::Private => "PRIVATE",
        }
    }
}

/// Video trim window in seconds. Only meaningful for [`MediaKind::Video`] routes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VideoTrim {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub is_muted: bool,
}

/// One stop within a journal entry, anchored to a single media asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub id: String,
    pub asset: AssetRef,
    pub media_kind: MediaKind,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub include_in_index: bool,
    #[serde(default)]
    pub price_label: String,
    #[serde(default)]
    pub review: u8,
    #[serde(default)]
    pub transportations: BTreeSet<Transportation>,
    #[serde(default)]
    pub video: Option<VideoTrim>,
}

impl RouteEntry {
    /// Routes are keyed `{entryId}_{assetId}` so the same asset maps to the
    /// same route on both sides.
    pub fn compose_id(polog_id: &str, asset_id: &str) -> String {
        format!("{}_{}", polog_id, asset_id)
    }

    pub fn new(polog_id: &str, asset: AssetRef, media_kind: MediaKind) -> Self {
        Self {
            id: Self::compose_id(polog_id, &asset.id),
            asset,
            media_kind,
            captured_at: None,
            description: String::new(),
            include_in_index: false,
            price_label: String::new(),
            review: 0,
            transportations: BTreeSet::new(),
            video: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Companion {
    User { id: String },
    Name { name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub first: String,
    pub second: String,
    pub third: String,
}

/// Journal entry content shared by drafts and staging snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PologContent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub foreword: Option<String>,
    #[serde(default)]
    pub afterword: Option<String>,
    #[serde(default)]
    pub label: Option<Label>,
    #[serde(default)]
    pub thumbnail: Option<AssetRef>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub companions: Vec<Companion>,
    pub visibility: Visibility,
    #[serde(default = "default_commentable")]
    pub is_commentable: bool,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

fn default_commentable() -> bool {
    true
}

impl PologContent {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            foreword: None,
            afterword: None,
            label: None,
            thumbnail: None,
            tags: BTreeSet::new(),
            companions: Vec::new(),
            visibility: Visibility::Public,
            is_commentable: true,
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PologDraft {
    pub content: PologContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PologDraft {
    pub fn new(content: PologContent) -> Self {
        let now = Utc::now();
        Self {
            content,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.content.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedRoute {
    pub route_id: String,
    pub remote_asset_url: String,
}

/// A committed journal entry queued for background publication.
#[derive(Debug, Clone)]
pub struct StagingEntry {
    pub id: String,
    pub polog: Option<PologContent>,
    pub total_upload_count: i64,
    pub uploaded_routes: Vec<UploadedRoute>,
    pub thumbnail_url: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Content revision, bumped on every commit. Bookkeeping written by the
    /// registrar only lands while the row still carries the revision it read.
    pub revision: i64,
}

impl StagingEntry {
    pub fn new(polog: PologContent) -> Self {
        Self {
            id: polog.id.clone(),
            polog: Some(polog),
            total_upload_count: 0,
            uploaded_routes: Vec::new(),
            thumbnail_url: None,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
            revision: 0,
        }
    }

    pub fn uploaded_url(&self, route_id: &str) -> Option<&str> {
        self.uploaded_routes
            .iter()
            .find(|r| r.route_id == route_id)
            .map(|r| r.remote_asset_url.as_str())
    }

    /// Record (or replace) the uploaded URL for a route.
    pub fn record_upload(&mut self, route_id: &str, url: &str) {
        match self
            .uploaded_routes
            .iter_mut()
            .find(|r| r.route_id == route_id)
        {
            Some(existing) => existing.remote_asset_url = url.to_string(),
            None => self.uploaded_routes.push(UploadedRoute {
                route_id: route_id.to_string(),
                remote_asset_url: url.to_string(),
            }),
        }
    }

    pub fn route_count(&self) -> usize {
        self.polog.as_ref().map(|p| p.routes.len()).unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Canonical remote representation kept locally after a successful publish.
///
/// Best-effort cache: a failed write is logged and the publish still counts,
/// and an `AlreadyExists` publish writes nothing. Query the remote service
/// when the current state matters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedPolog {
    pub id: String,
    pub thumbnail_url: Option<String>,
    pub routes: Vec<UploadedRoute>,
    pub published_at: DateTime<Utc>,
}
