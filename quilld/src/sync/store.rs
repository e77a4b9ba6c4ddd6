use std::{fs, path::{Path, PathBuf}};

use quill_core::{IdMapping, PullResponse, Resource, parse_timestamp_ms};
use sqlx::{
    Row as _, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use thiserror::Error;
use tokio::sync::broadcast;

use super::jobs::{JobKind, JobStatus, TransferJob};
use super::record::{
    Activity, ActivityType, Attachment, Filter, Note, RecordMeta, Space, Tag, now_ms,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("invalid job kind: {0}")]
    InvalidJobKind(String),
    #[error("invalid job status: {0}")]
    InvalidJobStatus(String),
    #[error("invalid resource tag: {0}")]
    InvalidResource(String),
    #[error("row not found after write")]
    MissingRow,
}

/// Every dirty row across entity types, gathered for one push phase.
#[derive(Debug, Default)]
pub struct DirtyBatch {
    pub spaces: Vec<Space>,
    pub notes: Vec<Note>,
    pub tags: Vec<Tag>,
    pub filters: Vec<Filter>,
    pub activity_types: Vec<ActivityType>,
    pub activities: Vec<Activity>,
    pub attachments: Vec<Attachment>,
}

impl DirtyBatch {
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

/// A local edit that was superseded by a concurrent server update, kept
/// for user review.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSnapshot {
    pub id: i64,
    pub resource: Resource,
    pub local_payload: String,
    pub server_payload: String,
    pub resolved: bool,
    pub created_at: i64,
}

#[derive(Debug, Default, PartialEq)]
pub struct PullApplied {
    pub applied: usize,
    /// Upper bound for the next checkpoint. Capped by the oldest row that
    /// could not be stored yet, so a strictly-after pull returns it again.
    pub checkpoint_candidate_ms: Option<i64>,
    pub changed_spaces: Vec<i64>,
}

/// Durable keyed storage for every syncable record, the transfer-job
/// queue, conflict snapshots and the pull checkpoint. The single shared
/// mutable resource: multi-row updates go through one sqlite transaction
/// so readers never observe partial state.
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    note_changes: broadcast::Sender<i64>,
}

fn table_name(resource: Resource) -> &'static str {
    match resource {
        Resource::Space => "spaces",
        Resource::Note => "notes",
        Resource::Tag => "tags",
        Resource::Filter => "filters",
        Resource::ActivityType => "activity_types",
        Resource::Activity => "activities",
        Resource::Attachment => "attachments",
    }
}

impl RecordStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (note_changes, _) = broadcast::channel(64);
        Self { pool, note_changes }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(StoreError::Unavailable)?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.create_record_table("spaces", "name TEXT NOT NULL").await?;
        self.create_record_table(
            "notes",
            "text TEXT NOT NULL,
             tags TEXT NOT NULL DEFAULT '[]',
             parent_id INTEGER,
             space_id INTEGER NOT NULL",
        )
        .await?;
        self.create_record_table("tags", "name TEXT NOT NULL, space_id INTEGER NOT NULL")
            .await?;
        self.create_record_table(
            "filters",
            "query TEXT NOT NULL, parent_id INTEGER, space_id INTEGER NOT NULL",
        )
        .await?;
        self.create_record_table(
            "activity_types",
            "name TEXT NOT NULL, value_kind TEXT NOT NULL, min_value REAL, max_value REAL",
        )
        .await?;
        self.create_record_table(
            "activities",
            "note_id INTEGER NOT NULL, type_id INTEGER, value REAL NOT NULL",
        )
        .await?;
        self.create_record_table(
            "attachments",
            "note_id INTEGER NOT NULL,
             file_name TEXT NOT NULL,
             mime_type TEXT NOT NULL,
             size INTEGER NOT NULL,
             blob_cached INTEGER NOT NULL DEFAULT 0",
        )
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transfer_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                attachment_id INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(kind, attachment_id)
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource TEXT NOT NULL,
                local_payload TEXT NOT NULL,
                server_payload TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK(id = 1),
                last_pulled_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_notes_space ON notes(space_id);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_record_table(&self, table: &str, extra: &str) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER,
                client_id TEXT,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                deleted_at INTEGER,
                dirty INTEGER NOT NULL DEFAULT 0,
                {extra}
            );"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        let idx = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_server ON {table}(server_id);"
        );
        sqlx::query(&idx).execute(&self.pool).await?;
        Ok(())
    }

    /// Search-index collaborator boundary: fires after local note writes
    /// and after a pull applies changes; carries the local space id.
    pub fn subscribe_note_changes(&self) -> broadcast::Receiver<i64> {
        self.note_changes.subscribe()
    }

    fn emit_notes_changed(&self, space_local_id: i64) {
        let _ = self.note_changes.send(space_local_id);
    }

    // ---- creation (fresh local rows: dirty, client_id assigned) ----

    pub async fn create_space(&self, name: &str) -> Result<Space, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO spaces (client_id, created_at, modified_at, dirty, name)
             VALUES (?1, ?2, ?3, 1, ?4)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(name)
        .execute(&self.pool)
        .await?;
        self.get_space(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_note(
        &self,
        space_id: i64,
        text: &str,
        tags: &[String],
        parent_id: Option<i64>,
    ) -> Result<Note, StoreError> {
        let meta = RecordMeta::new_local();
        let tags_json = serde_json::to_string(tags)?;
        let result = sqlx::query(
            "INSERT INTO notes (client_id, created_at, modified_at, dirty, text, tags, parent_id, space_id)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(text)
        .bind(tags_json)
        .bind(parent_id)
        .bind(space_id)
        .execute(&self.pool)
        .await?;
        self.emit_notes_changed(space_id);
        self.get_note(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_tag(&self, space_id: i64, name: &str) -> Result<Tag, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO tags (client_id, created_at, modified_at, dirty, name, space_id)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(name)
        .bind(space_id)
        .execute(&self.pool)
        .await?;
        self.get_tag(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_filter(
        &self,
        space_id: i64,
        query: &str,
        parent_id: Option<i64>,
    ) -> Result<Filter, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO filters (client_id, created_at, modified_at, dirty, query, parent_id, space_id)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(query)
        .bind(parent_id)
        .bind(space_id)
        .execute(&self.pool)
        .await?;
        self.get_filter(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_activity_type(
        &self,
        name: &str,
        value_kind: &str,
        min_value: Option<f64>,
        max_value: Option<f64>,
    ) -> Result<ActivityType, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO activity_types (client_id, created_at, modified_at, dirty, name, value_kind, min_value, max_value)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(name)
        .bind(value_kind)
        .bind(min_value)
        .bind(max_value)
        .execute(&self.pool)
        .await?;
        self.get_activity_type(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_activity(
        &self,
        note_id: i64,
        type_id: Option<i64>,
        value: f64,
    ) -> Result<Activity, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO activities (client_id, created_at, modified_at, dirty, note_id, type_id, value)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(note_id)
        .bind(type_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        self.get_activity(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    pub async fn create_attachment(
        &self,
        note_id: i64,
        file_name: &str,
        mime_type: &str,
        size: i64,
    ) -> Result<Attachment, StoreError> {
        let meta = RecordMeta::new_local();
        let result = sqlx::query(
            "INSERT INTO attachments (client_id, created_at, modified_at, dirty, note_id, file_name, mime_type, size, blob_cached)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, 0)",
        )
        .bind(&meta.client_id)
        .bind(meta.created_at)
        .bind(meta.modified_at)
        .bind(note_id)
        .bind(file_name)
        .bind(mime_type)
        .bind(size)
        .execute(&self.pool)
        .await?;
        self.get_attachment(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow)
    }

    // ---- fetches and range queries ----

    pub async fn get_space(&self, local_id: i64) -> Result<Option<Space>, StoreError> {
        fetch_space(&self.pool, local_id).await
    }

    pub async fn get_note(&self, local_id: i64) -> Result<Option<Note>, StoreError> {
        fetch_note(&self.pool, local_id).await
    }

    pub async fn get_tag(&self, local_id: i64) -> Result<Option<Tag>, StoreError> {
        fetch_tag(&self.pool, local_id).await
    }

    pub async fn get_filter(&self, local_id: i64) -> Result<Option<Filter>, StoreError> {
        fetch_filter(&self.pool, local_id).await
    }

    pub async fn get_activity_type(
        &self,
        local_id: i64,
    ) -> Result<Option<ActivityType>, StoreError> {
        fetch_activity_type(&self.pool, local_id).await
    }

    pub async fn get_activity(&self, local_id: i64) -> Result<Option<Activity>, StoreError> {
        fetch_activity(&self.pool, local_id).await
    }

    pub async fn get_attachment(&self, local_id: i64) -> Result<Option<Attachment>, StoreError> {
        fetch_attachment(&self.pool, local_id).await
    }

    /// Live (non-tombstoned) notes owned by a space.
    pub async fn notes_by_space(&self, space_id: i64) -> Result<Vec<Note>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM notes WHERE space_id = ?1 AND deleted_at IS NULL ORDER BY id ASC",
        )
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_note).collect()
    }

    // ---- the sanctioned mutation path ----

    /// The only way application code mutates a syncable row: flags it for
    /// the next push and bumps `modified_at` monotonically.
    pub async fn mark_dirty(&self, resource: Resource, local_id: i64) -> Result<(), StoreError> {
        let table = table_name(resource);
        let sql = format!(
            "UPDATE {table} SET dirty = 1, modified_at = MAX(?1, modified_at + 1) WHERE id = ?2"
        );
        let updated = sqlx::query(&sql)
            .bind(now_ms())
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::MissingRow);
        }
        if resource == Resource::Note
            && let Some(note) = self.get_note(local_id).await?
        {
            self.emit_notes_changed(note.space_id);
        }
        Ok(())
    }

    pub async fn update_note(
        &self,
        local_id: i64,
        text: &str,
        tags: &[String],
    ) -> Result<Note, StoreError> {
        let tags_json = serde_json::to_string(tags)?;
        let updated = sqlx::query(
            "UPDATE notes SET text = ?1, tags = ?2, dirty = 1, modified_at = MAX(?3, modified_at + 1)
             WHERE id = ?4",
        )
        .bind(text)
        .bind(tags_json)
        .bind(now_ms())
        .bind(local_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::MissingRow);
        }
        let note = self.get_note(local_id).await?.ok_or(StoreError::MissingRow)?;
        self.emit_notes_changed(note.space_id);
        Ok(note)
    }

    /// Deletion is tombstoning so the deletion itself can propagate.
    pub async fn tombstone(&self, resource: Resource, local_id: i64) -> Result<(), StoreError> {
        let table = table_name(resource);
        let now = now_ms();
        let sql = format!(
            "UPDATE {table}
             SET deleted_at = ?1, dirty = 1, modified_at = MAX(?1, modified_at + 1)
             WHERE id = ?2 AND deleted_at IS NULL"
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        if resource == Resource::Note
            && let Some(note) = self.get_note(local_id).await?
        {
            self.emit_notes_changed(note.space_id);
        }
        Ok(())
    }

    // ---- identity resolution ----

    pub async fn resolve_server_id(
        &self,
        resource: Resource,
        client_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let table = table_name(resource);
        let sql = format!("SELECT server_id FROM {table} WHERE client_id = ?1");
        let row = sqlx::query(&sql)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<Option<i64>, _>("server_id")).transpose()?.flatten())
    }

    pub async fn local_id_for_server(
        &self,
        resource: Resource,
        server_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        local_for_server(&mut conn, resource, server_id).await
    }

    pub async fn server_id_of(
        &self,
        resource: Resource,
        local_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let table = table_name(resource);
        let sql = format!("SELECT server_id FROM {table} WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<Option<i64>, _>("server_id")).transpose()?.flatten())
    }

    /// Bind a client id to its freshly assigned server id and collapse any
    /// duplicate row now sharing that server id.
    pub async fn apply_mapping(
        &self,
        resource: Resource,
        client_id: &str,
        server_id: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        apply_mapping_tx(&mut tx, resource, client_id, server_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_dirty(&self, resource: Resource, local_id: i64) -> Result<(), StoreError> {
        let table = table_name(resource);
        let sql = format!("UPDATE {table} SET dirty = 0 WHERE id = ?1");
        sqlx::query(&sql).bind(local_id).execute(&self.pool).await?;
        Ok(())
    }

    // ---- push support ----

    pub async fn dirty_batch(&self) -> Result<DirtyBatch, StoreError> {
        let mut batch = DirtyBatch::default();
        let rows = sqlx::query("SELECT * FROM spaces WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.spaces = rows.iter().map(map_space).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM notes WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.notes = rows.iter().map(map_note).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM tags WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.tags = rows.iter().map(map_tag).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM filters WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.filters = rows.iter().map(map_filter).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM activity_types WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.activity_types = rows.iter().map(map_activity_type).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM activities WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.activities = rows.iter().map(map_activity).collect::<Result<_, _>>()?;
        let rows = sqlx::query("SELECT * FROM attachments WHERE dirty = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        batch.attachments = rows.iter().map(map_attachment).collect::<Result<_, _>>()?;
        Ok(batch)
    }

    /// One transaction covering "clear dirty + apply mappings + collapse
    /// duplicates" so a crash can never leave a half-applied push.
    pub async fn apply_push_results(
        &self,
        pushed: &[(Resource, i64)],
        mappings: &[IdMapping],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (resource, local_id) in pushed {
            let table = table_name(*resource);
            let sql = format!("UPDATE {table} SET dirty = 0 WHERE id = ?1");
            sqlx::query(&sql).bind(local_id).execute(&mut *tx).await?;
        }
        for mapping in mappings {
            apply_mapping_tx(&mut tx, mapping.resource, &mapping.client_id, mapping.server_id)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- pull support ----

    /// Last successfully pulled server timestamp (unix ms); epoch when the
    /// store has never pulled.
    pub async fn checkpoint(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT last_pulled_at FROM checkpoint WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("last_pulled_at")).transpose()?.unwrap_or(0))
    }

    /// Advance-only: a stale candidate can never move the checkpoint back.
    pub async fn advance_checkpoint(&self, candidate_ms: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checkpoint (id, last_pulled_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET
                last_pulled_at = MAX(checkpoint.last_pulled_at, excluded.last_pulled_at)",
        )
        .bind(candidate_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply one pull response in a single transaction: match by server id,
    /// then by client id (push echo), else insert; server payload wins and
    /// clears dirty, except that a dirty local row is first preserved as a
    /// conflict snapshot. An activity or attachment whose owning note has no
    /// local match yet is left out, and the checkpoint candidate is capped
    /// below it so the next pull window carries it again.
    pub async fn apply_pull(&self, pull: &PullResponse) -> Result<PullApplied, StoreError> {
        let now = now_ms();
        let mut stats = PullStats::default();
        let mut tx = self.pool.begin().await?;

        for row in &pull.spaces {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            stats.observe(modified);
            match find_identity(&mut tx, Resource::Space, row.id, row.client_id.as_deref()).await? {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_space(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Space,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE spaces SET server_id = ?1, name = ?2, modified_at = ?3,
                         deleted_at = ?4, dirty = 0 WHERE id = ?5",
                    )
                    .bind(row.id)
                    .bind(&row.fields.name)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Space, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO spaces (server_id, client_id, created_at, modified_at, deleted_at, dirty, name)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(&row.fields.name)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        for row in &pull.notes {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            let Some(space_sid) = row.fields.space_id else {
                // no owning space on the wire; the row can never be stored
                stats.observe(modified);
                continue;
            };
            stats.observe(modified);
            let space_local = ensure_space_for_server(&mut tx, space_sid, now).await?;
            let parent_local = match row.fields.parent_id {
                Some(sid) => local_for_server(&mut tx, Resource::Note, sid).await?,
                None => None,
            };
            let tags_json = serde_json::to_string(&row.fields.tags)?;
            match find_identity(&mut tx, Resource::Note, row.id, row.client_id.as_deref()).await? {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_note(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Note,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE notes SET server_id = ?1, text = ?2, tags = ?3, parent_id = ?4,
                         space_id = ?5, modified_at = ?6, deleted_at = ?7, dirty = 0 WHERE id = ?8",
                    )
                    .bind(row.id)
                    .bind(&row.fields.text)
                    .bind(&tags_json)
                    .bind(parent_local)
                    .bind(space_local)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Note, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO notes (server_id, client_id, created_at, modified_at, deleted_at, dirty, text, tags, parent_id, space_id)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6, ?7, ?8)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(&row.fields.text)
                    .bind(&tags_json)
                    .bind(parent_local)
                    .bind(space_local)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
            stats.changed_spaces.insert(space_local);
        }

        for row in &pull.tags {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            let Some(space_sid) = row.fields.space_id else {
                stats.observe(modified);
                continue;
            };
            stats.observe(modified);
            let space_local = ensure_space_for_server(&mut tx, space_sid, now).await?;
            match find_identity(&mut tx, Resource::Tag, row.id, row.client_id.as_deref()).await? {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_tag(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Tag,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE tags SET server_id = ?1, name = ?2, space_id = ?3,
                         modified_at = ?4, deleted_at = ?5, dirty = 0 WHERE id = ?6",
                    )
                    .bind(row.id)
                    .bind(&row.fields.name)
                    .bind(space_local)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Tag, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO tags (server_id, client_id, created_at, modified_at, deleted_at, dirty, name, space_id)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(&row.fields.name)
                    .bind(space_local)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        for row in &pull.filters {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            let Some(space_sid) = row.fields.space_id else {
                stats.observe(modified);
                continue;
            };
            stats.observe(modified);
            let space_local = ensure_space_for_server(&mut tx, space_sid, now).await?;
            let parent_local = match row.fields.parent_id {
                Some(sid) => local_for_server(&mut tx, Resource::Filter, sid).await?,
                None => None,
            };
            match find_identity(&mut tx, Resource::Filter, row.id, row.client_id.as_deref()).await?
            {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_filter(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Filter,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE filters SET server_id = ?1, query = ?2, parent_id = ?3,
                         space_id = ?4, modified_at = ?5, deleted_at = ?6, dirty = 0 WHERE id = ?7",
                    )
                    .bind(row.id)
                    .bind(&row.fields.query)
                    .bind(parent_local)
                    .bind(space_local)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Filter, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO filters (server_id, client_id, created_at, modified_at, deleted_at, dirty, query, parent_id, space_id)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6, ?7)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(&row.fields.query)
                    .bind(parent_local)
                    .bind(space_local)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        for row in &pull.activity_types {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            stats.observe(modified);
            match find_identity(&mut tx, Resource::ActivityType, row.id, row.client_id.as_deref())
                .await?
            {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_activity_type(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::ActivityType,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE activity_types SET server_id = ?1, name = ?2, value_kind = ?3,
                         min_value = ?4, max_value = ?5, modified_at = ?6, deleted_at = ?7, dirty = 0
                         WHERE id = ?8",
                    )
                    .bind(row.id)
                    .bind(&row.fields.name)
                    .bind(&row.fields.value_kind)
                    .bind(row.fields.min_value)
                    .bind(row.fields.max_value)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::ActivityType, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO activity_types (server_id, client_id, created_at, modified_at, deleted_at, dirty, name, value_kind, min_value, max_value)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6, ?7, ?8)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(&row.fields.name)
                    .bind(&row.fields.value_kind)
                    .bind(row.fields.min_value)
                    .bind(row.fields.max_value)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        for row in &pull.activities {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            let Some(note_sid) = row.fields.note_id else {
                stats.observe(modified);
                continue;
            };
            let Some(note_local) = local_for_server(&mut tx, Resource::Note, note_sid).await?
            else {
                // owning note not pulled yet; retry on the next window
                stats.defer(modified);
                continue;
            };
            stats.observe(modified);
            let type_local = match row.fields.type_id {
                Some(sid) => local_for_server(&mut tx, Resource::ActivityType, sid).await?,
                None => None,
            };
            match find_identity(&mut tx, Resource::Activity, row.id, row.client_id.as_deref())
                .await?
            {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_activity(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Activity,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    sqlx::query(
                        "UPDATE activities SET server_id = ?1, note_id = ?2, type_id = ?3,
                         value = ?4, modified_at = ?5, deleted_at = ?6, dirty = 0 WHERE id = ?7",
                    )
                    .bind(row.id)
                    .bind(note_local)
                    .bind(type_local)
                    .bind(row.fields.value)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Activity, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO activities (server_id, client_id, created_at, modified_at, deleted_at, dirty, note_id, type_id, value)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6, ?7)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(note_local)
                    .bind(type_local)
                    .bind(row.fields.value)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        for row in &pull.attachments {
            let modified = parse_timestamp_ms(&row.modified_at)?;
            let deleted = parse_deleted(row.deleted_at.as_deref())?;
            let Some(note_sid) = row.fields.note_id else {
                stats.observe(modified);
                continue;
            };
            let Some(note_local) = local_for_server(&mut tx, Resource::Note, note_sid).await?
            else {
                stats.defer(modified);
                continue;
            };
            stats.observe(modified);
            match find_identity(&mut tx, Resource::Attachment, row.id, row.client_id.as_deref())
                .await?
            {
                Some((local_id, dirty)) => {
                    if dirty
                        && let Some(existing) = fetch_attachment(&mut *tx, local_id).await?
                    {
                        record_conflict_row(
                            &mut tx,
                            Resource::Attachment,
                            serde_json::to_string(&existing)?,
                            serde_json::to_string(row)?,
                            now,
                        )
                        .await?;
                        stats.conflicts += 1;
                    }
                    // blob_cached is local-only state and survives the merge
                    sqlx::query(
                        "UPDATE attachments SET server_id = ?1, note_id = ?2, file_name = ?3,
                         mime_type = ?4, size = ?5, modified_at = ?6, deleted_at = ?7, dirty = 0
                         WHERE id = ?8",
                    )
                    .bind(row.id)
                    .bind(note_local)
                    .bind(&row.fields.file_name)
                    .bind(&row.fields.mime_type)
                    .bind(row.fields.size)
                    .bind(modified)
                    .bind(deleted)
                    .bind(local_id)
                    .execute(&mut *tx)
                    .await?;
                    collapse_duplicates(&mut tx, Resource::Attachment, row.id).await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO attachments (server_id, client_id, created_at, modified_at, deleted_at, dirty, note_id, file_name, mime_type, size, blob_cached)
                         VALUES (?1, ?2, ?3, ?3, ?4, 0, ?5, ?6, ?7, ?8, 0)",
                    )
                    .bind(row.id)
                    .bind(&row.client_id)
                    .bind(modified)
                    .bind(deleted)
                    .bind(note_local)
                    .bind(&row.fields.file_name)
                    .bind(&row.fields.mime_type)
                    .bind(row.fields.size)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            stats.applied += 1;
        }

        tx.commit().await?;

        let changed_spaces: Vec<i64> = stats.changed_spaces.iter().copied().collect();
        for space in &changed_spaces {
            self.emit_notes_changed(*space);
        }
        Ok(PullApplied {
            applied: stats.applied,
            checkpoint_candidate_ms: stats.checkpoint_candidate(),
            changed_spaces,
        })
    }

    // ---- conflict snapshots ----

    pub async fn unresolved_conflicts(&self) -> Result<Vec<ConflictSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, resource, local_payload, server_payload, resolved, created_at
             FROM conflicts WHERE resolved = 0 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_conflict).collect()
    }

    pub async fn mark_conflict_resolved(&self, conflict_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE conflicts SET resolved = 1 WHERE id = ?1")
            .bind(conflict_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- transfer-job queue ----

    pub async fn enqueue_transfer_job(
        &self,
        kind: JobKind,
        attachment_id: i64,
        priority: i64,
    ) -> Result<i64, StoreError> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO transfer_jobs (kind, attachment_id, priority, status, attempts, retry_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?4)
             ON CONFLICT(kind, attachment_id) DO UPDATE SET
                priority = MAX(transfer_jobs.priority, excluded.priority),
                attempts = MIN(transfer_jobs.attempts, excluded.attempts),
                status = CASE WHEN transfer_jobs.status = 'running'
                              THEN transfer_jobs.status ELSE 'pending' END,
                retry_at = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(kind.as_str())
        .bind(attachment_id)
        .bind(priority)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Claim the highest-priority pending job whose dependency is
    /// satisfied: uploads wait for the owning note's server id, downloads
    /// for the attachment's server id and a missing blob; a job is skipped
    /// while a sibling job for the same attachment is running.
    pub async fn claim_transfer_job(&self, now: i64) -> Result<Option<TransferJob>, StoreError> {
        for _ in 0..3 {
            let row = sqlx::query(
                "SELECT j.id, j.kind, j.attachment_id, j.priority, j.status, j.attempts,
                        j.retry_at, j.last_error, j.created_at, j.updated_at
                 FROM transfer_jobs j
                 JOIN attachments a ON a.id = j.attachment_id
                 JOIN notes n ON n.id = a.note_id
                 WHERE j.status = 'pending'
                   AND (j.retry_at IS NULL OR j.retry_at <= ?1)
                   AND NOT EXISTS (
                        SELECT 1 FROM transfer_jobs r
                        WHERE r.attachment_id = j.attachment_id
                          AND r.status = 'running' AND r.id != j.id)
                   AND ((j.kind = 'upload' AND n.server_id IS NOT NULL)
                     OR (j.kind = 'download' AND a.server_id IS NOT NULL AND a.blob_cached = 0))
                 ORDER BY j.priority DESC, j.id ASC
                 LIMIT 1",
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let mut job = map_job(&row)?;

            let claimed = sqlx::query(
                "UPDATE transfer_jobs SET status = 'running', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
            )
            .bind(now)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 1 {
                job.status = JobStatus::Running;
                return Ok(Some(job));
            }
            // lost the claim race to another worker; look again
        }
        Ok(None)
    }

    pub async fn complete_transfer_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM transfer_jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns the job's new status: back to pending with a retry delay,
    /// or failed once the attempt budget is exhausted.
    pub async fn fail_transfer_job(
        &self,
        job: &TransferJob,
        retry_at: i64,
        last_error: &str,
        max_attempts: u32,
    ) -> Result<JobStatus, StoreError> {
        let attempts = job.attempts + 1;
        let now = now_ms();
        if attempts >= i64::from(max_attempts) {
            sqlx::query(
                "UPDATE transfer_jobs SET status = 'failed', attempts = ?1, last_error = ?2,
                 retry_at = NULL, updated_at = ?3 WHERE id = ?4",
            )
            .bind(attempts)
            .bind(last_error)
            .bind(now)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            Ok(JobStatus::Failed)
        } else {
            sqlx::query(
                "UPDATE transfer_jobs SET status = 'pending', attempts = ?1, last_error = ?2,
                 retry_at = ?3, updated_at = ?4 WHERE id = ?5",
            )
            .bind(attempts)
            .bind(last_error)
            .bind(retry_at)
            .bind(now)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            Ok(JobStatus::Pending)
        }
    }

    /// Persistent, user-visible failure count.
    pub async fn failed_job_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM transfer_jobs WHERE status = 'failed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Manual / next-launch re-enqueue path for failed jobs.
    pub async fn retry_failed_jobs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transfer_jobs SET status = 'pending', attempts = 0, retry_at = NULL,
             updated_at = ?1 WHERE status = 'failed'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// A crash mid-transfer leaves a stale running row; recover it.
    pub async fn reset_stale_running_jobs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transfer_jobs SET status = 'pending', updated_at = ?1
             WHERE status = 'running'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_transfer_job(&self, job_id: i64) -> Result<Option<TransferJob>, StoreError> {
        let row = sqlx::query(
            "SELECT id, kind, attachment_id, priority, status, attempts, retry_at, last_error,
                    created_at, updated_at
             FROM transfer_jobs WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_job).transpose()
    }

    pub async fn set_blob_cached(&self, attachment_id: i64, cached: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE attachments SET blob_cached = ?1 WHERE id = ?2")
            .bind(if cached { 1 } else { 0 })
            .bind(attachment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct PullStats {
    applied: usize,
    conflicts: usize,
    max_stored_ms: Option<i64>,
    min_deferred_ms: Option<i64>,
    changed_spaces: std::collections::BTreeSet<i64>,
}

impl PullStats {
    /// The row was stored (or is malformed beyond repair) and may be left
    /// behind by the checkpoint.
    fn observe(&mut self, modified_ms: i64) {
        self.max_stored_ms = Some(self.max_stored_ms.map_or(modified_ms, |m| m.max(modified_ms)));
    }

    /// The row was not stored because a reference it carries has no local
    /// match yet. The checkpoint must stay below it.
    fn defer(&mut self, modified_ms: i64) {
        self.min_deferred_ms =
            Some(self.min_deferred_ms.map_or(modified_ms, |m| m.min(modified_ms)));
    }

    fn checkpoint_candidate(&self) -> Option<i64> {
        match (self.max_stored_ms, self.min_deferred_ms) {
            (Some(stored), Some(deferred)) => Some(stored.min(deferred)),
            (stored, deferred) => stored.or(deferred),
        }
    }
}

fn parse_deleted(value: Option<&str>) -> Result<Option<i64>, StoreError> {
    Ok(value.map(parse_timestamp_ms).transpose()?)
}

async fn apply_mapping_tx(
    conn: &mut SqliteConnection,
    resource: Resource,
    client_id: &str,
    server_id: i64,
) -> Result<(), StoreError> {
    let table = table_name(resource);
    let sql = format!("UPDATE {table} SET server_id = ?1 WHERE client_id = ?2");
    sqlx::query(&sql)
        .bind(server_id)
        .bind(client_id)
        .execute(&mut *conn)
        .await?;
    collapse_duplicates(conn, resource, server_id).await
}

/// Two live rows must never share a server id: keep the row carrying a
/// client id (oldest local id as tie-break), drop the rest.
async fn collapse_duplicates(
    conn: &mut SqliteConnection,
    resource: Resource,
    server_id: i64,
) -> Result<(), StoreError> {
    let table = table_name(resource);
    let sql = format!(
        "DELETE FROM {table} WHERE server_id = ?1 AND id NOT IN (
            SELECT id FROM {table} WHERE server_id = ?1
            ORDER BY (client_id IS NULL) ASC, id ASC LIMIT 1)"
    );
    sqlx::query(&sql).bind(server_id).execute(conn).await?;
    Ok(())
}

async fn find_identity(
    conn: &mut SqliteConnection,
    resource: Resource,
    server_id: i64,
    client_id: Option<&str>,
) -> Result<Option<(i64, bool)>, StoreError> {
    let table = table_name(resource);
    let sql = format!("SELECT id, dirty FROM {table} WHERE server_id = ?1 LIMIT 1");
    if let Some(row) = sqlx::query(&sql)
        .bind(server_id)
        .fetch_optional(&mut *conn)
        .await?
    {
        let dirty: i64 = row.try_get("dirty")?;
        return Ok(Some((row.try_get("id")?, dirty != 0)));
    }
    if let Some(client_id) = client_id {
        let sql = format!("SELECT id, dirty FROM {table} WHERE client_id = ?1 LIMIT 1");
        if let Some(row) = sqlx::query(&sql)
            .bind(client_id)
            .fetch_optional(&mut *conn)
            .await?
        {
            let dirty: i64 = row.try_get("dirty")?;
            return Ok(Some((row.try_get("id")?, dirty != 0)));
        }
    }
    Ok(None)
}

async fn local_for_server(
    conn: &mut SqliteConnection,
    resource: Resource,
    server_id: i64,
) -> Result<Option<i64>, StoreError> {
    let table = table_name(resource);
    let sql = format!("SELECT id FROM {table} WHERE server_id = ?1 LIMIT 1");
    let row = sqlx::query(&sql)
        .bind(server_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(|r| r.try_get("id")).transpose()?)
}

/// A pulled row may reference a space this client has never seen (ordering
/// hiccup or filtered pull); keep availability by inserting a clean stub
/// the next space pull will flesh out.
async fn ensure_space_for_server(
    conn: &mut SqliteConnection,
    server_id: i64,
    now: i64,
) -> Result<i64, StoreError> {
    if let Some(local) = local_for_server(conn, Resource::Space, server_id).await? {
        return Ok(local);
    }
    let result = sqlx::query(
        "INSERT INTO spaces (server_id, created_at, modified_at, dirty, name)
         VALUES (?1, ?2, ?2, 0, '')",
    )
    .bind(server_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn record_conflict_row(
    conn: &mut SqliteConnection,
    resource: Resource,
    local_payload: String,
    server_payload: String,
    now: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO conflicts (resource, local_payload, server_payload, resolved, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
    )
    .bind(resource.as_str())
    .bind(local_payload)
    .bind(server_payload)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

// ---- row mappers ----

fn meta_from_row(row: &SqliteRow) -> Result<RecordMeta, StoreError> {
    let dirty: i64 = row.try_get("dirty")?;
    Ok(RecordMeta {
        local_id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        client_id: row.try_get("client_id")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        deleted_at: row.try_get("deleted_at")?,
        dirty: dirty != 0,
    })
}

fn map_space(row: &SqliteRow) -> Result<Space, StoreError> {
    Ok(Space {
        meta: meta_from_row(row)?,
        name: row.try_get("name")?,
    })
}

fn map_note(row: &SqliteRow) -> Result<Note, StoreError> {
    let tags: String = row.try_get("tags")?;
    Ok(Note {
        meta: meta_from_row(row)?,
        text: row.try_get("text")?,
        tags: serde_json::from_str(&tags)?,
        parent_id: row.try_get("parent_id")?,
        space_id: row.try_get("space_id")?,
    })
}

fn map_tag(row: &SqliteRow) -> Result<Tag, StoreError> {
    Ok(Tag {
        meta: meta_from_row(row)?,
        name: row.try_get("name")?,
        space_id: row.try_get("space_id")?,
    })
}

fn map_filter(row: &SqliteRow) -> Result<Filter, StoreError> {
    Ok(Filter {
        meta: meta_from_row(row)?,
        query: row.try_get("query")?,
        parent_id: row.try_get("parent_id")?,
        space_id: row.try_get("space_id")?,
    })
}

fn map_activity_type(row: &SqliteRow) -> Result<ActivityType, StoreError> {
    Ok(ActivityType {
        meta: meta_from_row(row)?,
        name: row.try_get("name")?,
        value_kind: row.try_get("value_kind")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
    })
}

fn map_activity(row: &SqliteRow) -> Result<Activity, StoreError> {
    Ok(Activity {
        meta: meta_from_row(row)?,
        note_id: row.try_get("note_id")?,
        type_id: row.try_get("type_id")?,
        value: row.try_get("value")?,
    })
}

fn map_attachment(row: &SqliteRow) -> Result<Attachment, StoreError> {
    let blob_cached: i64 = row.try_get("blob_cached")?;
    Ok(Attachment {
        meta: meta_from_row(row)?,
        note_id: row.try_get("note_id")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        size: row.try_get("size")?,
        blob_cached: blob_cached != 0,
    })
}

fn map_conflict(row: &SqliteRow) -> Result<ConflictSnapshot, StoreError> {
    let resource: String = row.try_get("resource")?;
    let resolved: i64 = row.try_get("resolved")?;
    Ok(ConflictSnapshot {
        id: row.try_get("id")?,
        resource: Resource::parse(&resource).ok_or(StoreError::InvalidResource(resource))?,
        local_payload: row.try_get("local_payload")?,
        server_payload: row.try_get("server_payload")?,
        resolved: resolved != 0,
        created_at: row.try_get("created_at")?,
    })
}

fn map_job(row: &SqliteRow) -> Result<TransferJob, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(TransferJob {
        id: row.try_get("id")?,
        kind: JobKind::parse(&kind).ok_or(StoreError::InvalidJobKind(kind))?,
        attachment_id: row.try_get("attachment_id")?,
        priority: row.try_get("priority")?,
        status: JobStatus::parse(&status).ok_or(StoreError::InvalidJobStatus(status))?,
        attempts: row.try_get("attempts")?,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---- executor-generic single-row fetchers (usable inside transactions) ----

async fn fetch_space<'e, E>(executor: E, local_id: i64) -> Result<Option<Space>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM spaces WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_space).transpose()
}

async fn fetch_note<'e, E>(executor: E, local_id: i64) -> Result<Option<Note>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM notes WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_note).transpose()
}

async fn fetch_tag<'e, E>(executor: E, local_id: i64) -> Result<Option<Tag>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM tags WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_tag).transpose()
}

async fn fetch_filter<'e, E>(executor: E, local_id: i64) -> Result<Option<Filter>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM filters WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_filter).transpose()
}

async fn fetch_activity_type<'e, E>(
    executor: E,
    local_id: i64,
) -> Result<Option<ActivityType>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM activity_types WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_activity_type).transpose()
}

async fn fetch_activity<'e, E>(executor: E, local_id: i64) -> Result<Option<Activity>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM activities WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_activity).transpose()
}

async fn fetch_attachment<'e, E>(
    executor: E,
    local_id: i64,
) -> Result<Option<Attachment>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM attachments WHERE id = ?1")
        .bind(local_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_attachment).transpose()
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("quill");
    path.push("sync.db");
    Ok(path)
}
