use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Shared identity and dirty-state metadata carried by every syncable row.
///
/// A row is created locally with a fresh `client_id` and `dirty = true`,
/// gains its durable `server_id` when a push response maps the client id,
/// and is deleted by stamping `deleted_at` so the tombstone itself can
/// propagate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordMeta {
    pub local_id: i64,
    pub server_id: Option<i64>,
    pub client_id: Option<String>,
    pub created_at: i64,
    pub modified_at: i64,
    pub deleted_at: Option<i64>,
    pub dirty: bool,
}

impl RecordMeta {
    /// Metadata for a freshly created local row, before it has a rowid.
    pub fn new_local() -> Self {
        let now = now_ms();
        Self {
            local_id: 0,
            server_id: None,
            client_id: Some(Uuid::new_v4().to_string()),
            created_at: now,
            modified_at: now,
            deleted_at: None,
            dirty: true,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Space {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub text: String,
    pub tags: Vec<String>,
    /// Weak reference to another local note, used for threading.
    pub parent_id: Option<i64>,
    /// Owning space, by local id.
    pub space_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    pub space_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Opaque query parameters, serialized JSON.
    pub query: String,
    pub parent_id: Option<i64>,
    pub space_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityType {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    pub value_kind: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub note_id: i64,
    pub type_id: Option<i64>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub note_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
    /// Whether the binary payload is currently present in the local cache.
    pub blob_cached: bool,
}
