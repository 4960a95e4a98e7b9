use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::model::{Companion, PologContent};

pub mod model;

pub use model::{GroupAsset, PologInput, RemotePolog, RemoteRoute, RouteInput};
use model::{GraphqlError, GraphqlResponse, GroupAssetNode, LabelInput, PologNode, VideoInput};

const POLOG_QUERY: &str = r#"query Polog($id: ID!) {
  polog(id: $id) { id thumbnailUrl routes { id assetUrl } }
}"#;

const GROUP_ASSET_QUERY: &str = r#"query GroupAsset($id: ID!) {
  groupAsset(id: $id) { id signedUrl mediaKind }
}"#;

const CREATE_POLOG_MUTATION: &str = r#"mutation CreatePolog($input: PologInput!) {
  createPolog(input: $input) { id thumbnailUrl routes { id assetUrl } }
}"#;

const UPDATE_POLOG_MUTATION: &str = r#"mutation UpdatePolog($input: PologInput!) {
  updatePolog(input: $input) { id thumbnailUrl routes { id assetUrl } }
}"#;

/// Errors surfaced by the publication API.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Generic(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// The query/mutation surface the synchronizer needs from the remote service.
#[async_trait]
pub trait PublicationGateway: Send + Sync {
    async fn fetch_polog(&self, id: &str) -> Result<RemotePolog, GatewayError>;

    async fn fetch_group_asset(&self, id: &str) -> Result<GroupAsset, GatewayError>;

    async fn create_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError>;

    async fn update_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError>;

    /// Fetch raw bytes behind a (signed) download URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>, GatewayError>;
}

#[derive(Clone)]
pub struct GraphqlGateway {
    http: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for GraphqlGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphqlGateway")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl GraphqlGateway {
    pub fn new(endpoint: Url, token: String, timeout: Duration) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .user_agent("polog-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    pub fn build_request(&self, query: &str, variables: Value) -> Result<reqwest::Request, GatewayError> {
        let body = json!({ "query": query, "variables": variables });
        Ok(self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .json(&body)
            .build()?)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        field: &str,
    ) -> Result<T, GatewayError> {
        let request = self.build_request(query, variables)?;
        debug!(url = %request.url(), field, "sending graphql request");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Unauthorized);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Generic(format!("http {}: {}", status, body)));
        }

        let payload: GraphqlResponse = res
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        extract_field(payload, field)
    }
}

/// Pull `data.<field>` out of a response, turning GraphQL errors into
/// [`GatewayError`] variants.
pub(crate) fn extract_field<T: DeserializeOwned>(
    payload: GraphqlResponse,
    field: &str,
) -> Result<T, GatewayError> {
    if let Some(first) = payload.errors.into_iter().next() {
        return Err(classify_error(first));
    }
    let value = payload
        .data
        .and_then(|mut data| data.get_mut(field).map(Value::take))
        .filter(|v| !v.is_null())
        .ok_or(GatewayError::NotFound)?;
    serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))
}

fn classify_error(err: GraphqlError) -> GatewayError {
    let code = err
        .extensions
        .and_then(|ext| ext.code)
        .unwrap_or_default()
        .to_ascii_uppercase();
    match code.as_str() {
        "NOT_FOUND" => GatewayError::NotFound,
        "ALREADY_EXISTS" | "CONFLICT" => GatewayError::AlreadyExists,
        "UNAUTHENTICATED" | "UNAUTHORIZED" | "FORBIDDEN" => GatewayError::Unauthorized,
        _ => GatewayError::Generic(err.message),
    }
}

#[async_trait]
impl PublicationGateway for GraphqlGateway {
    async fn fetch_polog(&self, id: &str) -> Result<RemotePolog, GatewayError> {
        let node: PologNode = self
            .execute(POLOG_QUERY, json!({ "id": id }), "polog")
            .await?;
        Ok(node.into())
    }

    async fn fetch_group_asset(&self, id: &str) -> Result<GroupAsset, GatewayError> {
        let node: GroupAssetNode = self
            .execute(GROUP_ASSET_QUERY, json!({ "id": id }), "groupAsset")
            .await?;
        let media_kind = crate::model::MediaKind::parse_kind(&node.media_kind).ok_or_else(|| {
            GatewayError::Decode(format!("unknown media kind {}", node.media_kind))
        })?;
        Ok(GroupAsset {
            id: node.id,
            url: node.signed_url,
            media_kind,
        })
    }

    async fn create_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError> {
        let node: PologNode = self
            .execute(CREATE_POLOG_MUTATION, json!({ "input": input }), "createPolog")
            .await?;
        Ok(node.into())
    }

    async fn update_polog(&self, input: &PologInput) -> Result<RemotePolog, GatewayError> {
        let node: PologNode = self
            .execute(UPDATE_POLOG_MUTATION, json!({ "input": input }), "updatePolog")
            .await?;
        Ok(node.into())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let res = self.http.get(url).send().await?;
        match res.status() {
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GatewayError::Unauthorized),
            s if !s.is_success() => Err(GatewayError::Generic(format!("download failed: http {}", s))),
            _ => Ok(res.bytes().await?.to_vec()),
        }
    }
}

/// Build the mutation payload for `content`. `route_urls` must be aligned with
/// `content.routes`.
pub fn build_polog_input(
    content: &PologContent,
    route_urls: &[String],
    thumbnail_url: Option<String>,
) -> PologInput {
    let (companion_user_ids, companion_names) = content.companions.iter().fold(
        (Vec::new(), Vec::new()),
        |(mut ids, mut names), companion| {
            match companion {
                Companion::User { id } => ids.push(id.clone()),
                Companion::Name { name } => names.push(name.clone()),
            }
            (ids, names)
        },
    );

    let routes = content
        .routes
        .iter()
        .zip(route_urls)
        .map(|(route, url)| RouteInput {
            id: route.id.clone(),
            asset_url: url.clone(),
            media_kind: route.media_kind.as_str(),
            captured_at: route.captured_at.map(|d| d.to_rfc3339()),
            description: route.description.clone(),
            include_in_index: route.include_in_index,
            price_label: route.price_label.clone(),
            review: route.review.min(5),
            transportations: route.transportations.iter().map(|t| t.as_str()).collect(),
            video: match route.media_kind {
                crate::model::MediaKind::Video => route.video.map(|v| VideoInput {
                    start_seconds: v.start_seconds,
                    end_seconds: v.end_seconds,
                    is_muted: v.is_muted,
                }),
                crate::model::MediaKind::Photo => None,
            },
        })
        .collect();

    PologInput {
        id: content.id.clone(),
        title: content.title.clone(),
        foreword: content.foreword.clone(),
        afterword: content.afterword.clone(),
        label: content.label.as_ref().map(|l| LabelInput {
            first: l.first.clone(),
            second: l.second.clone(),
            third: l.third.clone(),
        }),
        thumbnail_url,
        companion_user_ids,
        companion_names,
        visibility: content.visibility.as_str(),
        tags: content.tags.iter().cloned().collect(),
        is_commentable: content.is_commentable,
        routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetRef, Label, MediaKind, RouteEntry, Transportation, VideoTrim, Visibility};

    fn response(value: Value) -> GraphqlResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn extract_field_reads_data() {
        let payload = response(json!({
            "data": { "polog": { "id": "p1", "thumbnailUrl": "https://t", "routes": [
                { "id": "p1_a", "assetUrl": "https://a" },
                { "id": "p1_b", "assetUrl": null }
            ] } }
        }));
        let node: PologNode = extract_field(payload, "polog").unwrap();
        let remote: RemotePolog = node.into();
        assert_eq!(remote.route_url("p1_a"), Some("https://a"));
        assert_eq!(remote.route_url("p1_b"), None);
        assert_eq!(remote.thumbnail_url.as_deref(), Some("https://t"));
    }

    #[test]
    fn null_field_is_not_found() {
        let payload = response(json!({ "data": { "polog": null } }));
        let err = extract_field::<PologNode>(payload, "polog").unwrap_err();
        assert!(matches!(err, GatewayError::NotFound));
    }

    #[test]
    fn error_codes_are_classified() {
        let cases = [
            ("NOT_FOUND", "NotFound"),
            ("ALREADY_EXISTS", "AlreadyExists"),
            ("conflict", "AlreadyExists"),
            ("UNAUTHENTICATED", "Unauthorized"),
            ("INTERNAL", "Generic"),
        ];
        for (code, expected) in cases {
            let payload = response(json!({
                "data": null,
                "errors": [{ "message": "boom", "extensions": { "code": code } }]
            }));
            let err = extract_field::<PologNode>(payload, "polog").unwrap_err();
            let actual = match err {
                GatewayError::NotFound => "NotFound",
                GatewayError::AlreadyExists => "AlreadyExists",
                GatewayError::Unauthorized => "Unauthorized",
                GatewayError::Generic(ref msg) => {
                    assert_eq!(msg, "boom");
                    "Generic"
                }
                _ => "other",
            };
            assert_eq!(actual, expected, "code {}", code);
        }
    }

    #[test]
    fn build_request_sets_headers() {
        let gateway = GraphqlGateway::new(
            Url::parse("https://api.example/graphql").unwrap(),
            "token".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = gateway
            .build_request(POLOG_QUERY, json!({ "id": "p1" }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/graphql");
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
    }

    #[test]
    fn polog_input_carries_full_payload() {
        let mut content = PologContent::new("Lisbon");
        content.visibility = Visibility::Followers;
        content.label = Some(Label {
            first: "PT".into(),
            second: "Lisbon".into(),
            third: "Alfama".into(),
        });
        content.tags.insert("food".into());
        content.companions = vec![
            Companion::User { id: "u1".into() },
            Companion::Name { name: "Rui".into() },
        ];
        let id = content.id.clone();
        let mut photo = RouteEntry::new(&id, AssetRef::local("a"), MediaKind::Photo);
        photo.transportations.insert(Transportation::Walk);
        photo.review = 9;
        photo.video = Some(VideoTrim {
            start_seconds: 0.0,
            end_seconds: 3.0,
            is_muted: false,
        });
        let mut video = RouteEntry::new(&id, AssetRef::local("b"), MediaKind::Video);
        video.video = Some(VideoTrim {
            start_seconds: 1.5,
            end_seconds: 10.0,
            is_muted: true,
        });
        content.routes = vec![photo, video];

        let input = build_polog_input(
            &content,
            &["https://a".to_string(), "https://b".to_string()],
            Some("https://t".into()),
        );
        assert_eq!(input.visibility, "FOLLOWERS");
        assert_eq!(input.companion_user_ids, vec!["u1".to_string()]);
        assert_eq!(input.companion_names, vec!["Rui".to_string()]);
        assert_eq!(input.routes[0].asset_url, "https://a");
        assert_eq!(input.routes[0].review, 5);
        assert_eq!(input.routes[0].transportations, vec!["WALK"]);
        assert!(input.routes[0].video.is_none());
        assert_eq!(input.routes[1].video.as_ref().unwrap().start_seconds, 1.5);

        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["thumbnailUrl"], "https://t");
        assert_eq!(json["routes"][1]["mediaKind"], "VIDEO");
        assert_eq!(json["label"]["third"], "Alfama");
    }
}
