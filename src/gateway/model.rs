//! Wire types for the publication GraphQL API.
use crate::model::{MediaKind, UploadedRoute};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRoute {
    pub id: String,
    pub asset_url: String,
}

/// Current server-side state of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePolog {
    pub id: String,
    pub thumbnail_url: Option<String>,
    pub routes: Vec<RemoteRoute>,
}

impl RemotePolog {
    pub fn route_url(&self, route_id: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.id == route_id)
            .map(|r| r.asset_url.as_str())
            .filter(|url| !url.is_empty())
    }

    pub fn uploaded_routes(&self) -> Vec<UploadedRoute> {
        self.routes
            .iter()
            .map(|r| UploadedRoute {
                route_id: r.id.clone(),
                remote_asset_url: r.asset_url.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAsset {
    pub id: String,
    pub url: String,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelInput {
    pub first: String,
    pub second: String,
    pub third: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoInput {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub is_muted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteInput {
    pub id: String,
    pub asset_url: String,
    pub media_kind: &'static str,
    pub captured_at: Option<String>,
    pub description: String,
    pub include_in_index: bool,
    pub price_label: String,
    pub review: u8,
    pub transportations: Vec<&'static str>,
    pub video: Option<VideoInput>,
}

/// Full payload of the create and update mutations.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PologInput {
    pub id: String,
    pub title: String,
    pub foreword: Option<String>,
    pub afterword: Option<String>,
    pub label: Option<LabelInput>,
    pub thumbnail_url: Option<String>,
    pub companion_user_ids: Vec<String>,
    pub companion_names: Vec<String>,
    pub visibility: &'static str,
    pub tags: Vec<String>,
    pub is_commentable: bool,
    pub routes: Vec<RouteInput>,
}

// --- response envelopes -----------------------------------------------------

#[derive(Deserialize, Debug)]
pub(crate) struct GraphqlResponse {
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<GraphqlErrorExtensions>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct GraphqlErrorExtensions {
    pub code: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PologNode {
    pub id: String,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteNode>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteNode {
    pub id: String,
    pub asset_url: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupAssetNode {
    pub id: String,
    pub signed_url: String,
    pub media_kind: String,
}

impl From<PologNode> for RemotePolog {
    fn from(node: PologNode) -> Self {
        Self {
            id: node.id,
            thumbnail_url: node.thumbnail_url.filter(|u| !u.is_empty()),
            routes: node
                .routes
                .into_iter()
                .map(|r| RemoteRoute {
                    id: r.id,
                    asset_url: r.asset_url.unwrap_or_default(),
                })
                .collect(),
        }
    }
}
