use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum QuillError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("timestamp out of range: {0}")]
    TimestampRange(#[from] time::error::ComponentRange),
    #[error("timestamp format error: {0}")]
    TimestampFormat(#[from] time::error::Format),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl QuillError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            QuillError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Format a unix-millisecond timestamp as RFC3339 for the wire.
pub fn format_timestamp_ms(ms: i64) -> Result<String, QuillError> {
    let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)?;
    Ok(ts.format(&Rfc3339)?)
}

/// Parse an RFC3339 timestamp into unix milliseconds.
pub fn parse_timestamp_ms(value: &str) -> Result<i64, time::error::Parse> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[derive(Clone)]
pub struct QuillClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl QuillClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, QuillError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// One bulk change request carrying every dirty row of the cycle.
    pub async fn push(&self, request: &PushRequest) -> Result<PushResponse, QuillError> {
        let url = self.endpoint("/sync/push")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// All entities modified strictly after `since_ms`.
    pub async fn pull(&self, since_ms: i64) -> Result<PullResponse, QuillError> {
        let mut url = self.endpoint("/sync")?;
        url.query_pairs_mut()
            .append_pair("since", &format_timestamp_ms(since_ms)?);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Single-resource tombstone fast path for notes that already have a
    /// server identity.
    pub async fn delete_note(&self, server_id: i64) -> Result<(), QuillError> {
        let url = self.endpoint(&format!("/notes/{server_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(QuillError::Api { status, body })
    }

    /// Provision a space server-side so rows owned by it can be pushed.
    /// Idempotent on `client_id`.
    pub async fn create_space(
        &self,
        name: &str,
        client_id: &str,
    ) -> Result<CreatedResource, QuillError> {
        let url = self.endpoint("/spaces")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CreateSpaceRequest { name, client_id })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub fn attachment_download_url(&self, server_id: i64) -> Result<Url, QuillError> {
        Ok(self
            .base_url
            .join(&format!("/attachments/{server_id}/blob"))?)
    }

    pub fn attachment_upload_url(&self, client_id: &str) -> Result<Url, QuillError> {
        let mut url = self.base_url.join("/attachments/blob")?;
        url.query_pairs_mut().append_pair("client_id", client_id);
        Ok(url)
    }

    pub fn bearer_token(&self) -> &str {
        &self.token
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, QuillError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, QuillError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(QuillError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Space,
    Note,
    Tag,
    Filter,
    ActivityType,
    Activity,
    Attachment,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Space => "space",
            Resource::Note => "note",
            Resource::Tag => "tag",
            Resource::Filter => "filter",
            Resource::ActivityType => "activity_type",
            Resource::Activity => "activity",
            Resource::Attachment => "attachment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "space" => Some(Resource::Space),
            "note" => Some(Resource::Note),
            "tag" => Some(Resource::Tag),
            "filter" => Some(Resource::Filter),
            "activity_type" => Some(Resource::ActivityType),
            "activity" => Some(Resource::Activity),
            "attachment" => Some(Resource::Attachment),
            _ => None,
        }
    }
}

/// Outbound change row: `id` is the known server id or null, `client_id`
/// is included whenever the server id is absent, tombstones carry
/// `deleted_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change<T> {
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub modified_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(flatten)]
    pub fields: T,
}

/// Inbound pull row: the server id is always present; `client_id` is
/// echoed back for rows this client originally created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row<T> {
    pub id: i64,
    #[serde(default)]
    pub client_id: Option<String>,
    pub modified_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
    #[serde(flatten)]
    pub fields: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceFields {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteFields {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub space_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFields {
    pub name: String,
    #[serde(default)]
    pub space_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterFields {
    /// Opaque query parameters, serialized JSON.
    pub query: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub space_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTypeFields {
    pub name: String,
    pub value_kind: String,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityFields {
    #[serde(default)]
    pub note_id: Option<i64>,
    #[serde(default)]
    pub type_id: Option<i64>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentFields {
    #[serde(default)]
    pub note_id: Option<i64>,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub spaces: Vec<Change<SpaceFields>>,
    #[serde(default)]
    pub notes: Vec<Change<NoteFields>>,
    #[serde(default)]
    pub tags: Vec<Change<TagFields>>,
    #[serde(default)]
    pub filters: Vec<Change<FilterFields>>,
    #[serde(default)]
    pub activity_types: Vec<Change<ActivityTypeFields>>,
    #[serde(default)]
    pub activities: Vec<Change<ActivityFields>>,
    #[serde(default)]
    pub attachments: Vec<Change<AttachmentFields>>,
}

impl PushRequest {
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
            && self.notes.is_empty()
            && self.tags.is_empty()
            && self.filters.is_empty()
            && self.activity_types.is_empty()
            && self.activities.is_empty()
            && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMapping {
    pub resource: Resource,
    pub client_id: String,
    pub server_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub applied: u64,
    #[serde(default)]
    pub mappings: Vec<IdMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub spaces: Vec<Row<SpaceFields>>,
    #[serde(default)]
    pub notes: Vec<Row<NoteFields>>,
    #[serde(default)]
    pub tags: Vec<Row<TagFields>>,
    #[serde(default)]
    pub filters: Vec<Row<FilterFields>>,
    #[serde(default)]
    pub activity_types: Vec<Row<ActivityTypeFields>>,
    #[serde(default)]
    pub activities: Vec<Row<ActivityFields>>,
    #[serde(default)]
    pub attachments: Vec<Row<AttachmentFields>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedResource {
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct CreateSpaceRequest<'a> {
    name: &'a str,
    client_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_client(server: &MockServer) -> QuillClient {
        QuillClient::new(&server.uri(), "test-token").unwrap()
    }

    #[tokio::test]
    async fn push_sends_bulk_changes_and_reads_mappings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/push"))
            .and(header("authorization", "Bearer test-token"))
            .and(body_partial_json(serde_json::json!({
                "notes": [{ "id": null, "client_id": "c1", "text": "buy milk" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "applied": 1,
                "mappings": [
                    { "resource": "note", "client_id": "c1", "server_id": 42 }
                ]
            })))
            .mount(&server)
            .await;

        let mut request = PushRequest::default();
        request.notes.push(Change {
            id: None,
            client_id: Some("c1".into()),
            modified_at: "2024-01-01T00:00:00Z".into(),
            deleted_at: None,
            fields: NoteFields {
                text: "buy milk".into(),
                tags: vec!["todo".into()],
                parent_id: None,
                space_id: Some(7),
            },
        });

        let response = make_client(&server).push(&request).await.unwrap();
        assert_eq!(response.applied, 1);
        assert_eq!(response.mappings.len(), 1);
        assert_eq!(response.mappings[0].resource, Resource::Note);
        assert_eq!(response.mappings[0].server_id, 42);
    }

    #[tokio::test]
    async fn pull_queries_strictly_after_since() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sync"))
            .and(query_param("since", "2024-01-01T00:00:00.5Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "notes": [
                    {
                        "id": 42,
                        "client_id": "c1",
                        "text": "buy milk",
                        "tags": [],
                        "space_id": 7,
                        "modified_at": "2024-01-01T00:00:01Z"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let since = parse_timestamp_ms("2024-01-01T00:00:00.5Z").unwrap();
        let response = make_client(&server).pull(since).await.unwrap();
        assert_eq!(response.notes.len(), 1);
        assert_eq!(response.notes[0].id, 42);
        assert_eq!(response.notes[0].client_id.as_deref(), Some("c1"));
        assert!(response.spaces.is_empty());
    }

    #[tokio::test]
    async fn delete_note_treats_not_found_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/notes/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        make_client(&server).delete_note(42).await.unwrap();
    }

    #[tokio::test]
    async fn create_space_returns_server_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/spaces"))
            .and(body_partial_json(serde_json::json!({
                "name": "Journal",
                "client_id": "s1"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 7 })),
            )
            .mount(&server)
            .await;

        let created = make_client(&server).create_space("Journal", "s1").await.unwrap();
        assert_eq!(created.id, 7);
    }

    #[tokio::test]
    async fn unauthorized_classifies_as_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = make_client(&server).pull(0).await.unwrap_err();
        assert!(err.is_auth());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_errors_classify_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/push"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = make_client(&server)
            .push(&PushRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
        assert!(err.is_retryable());
    }

    #[test]
    fn timestamp_round_trip_keeps_millisecond_precision() {
        let ms = parse_timestamp_ms("2024-06-01T12:30:45.123Z").unwrap();
        assert_eq!(format_timestamp_ms(ms).unwrap(), "2024-06-01T12:30:45.123Z");
    }

    #[test]
    fn resource_codec_is_exhaustive() {
        for resource in [
            Resource::Space,
            Resource::Note,
            Resource::Tag,
            Resource::Filter,
            Resource::ActivityType,
            Resource::Activity,
            Resource::Attachment,
        ] {
            assert_eq!(Resource::parse(resource.as_str()), Some(resource));
        }
        assert_eq!(Resource::parse("bogus"), None);
    }
}
