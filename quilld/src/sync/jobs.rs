use std::path::PathBuf;

use quill_core::{QuillClient, QuillError, Resource};
use thiserror::Error;

use super::backoff::Backoff;
use super::cache::{CachePathError, blob_path_for};
use super::engine::AuthState;
use super::record::now_ms;
use super::store::{RecordStore, StoreError};
use super::transfer::{TransferClient, TransferError};

pub const DEFAULT_UPLOAD_PRIORITY: i64 = 50;
pub const DEFAULT_DOWNLOAD_PRIORITY: i64 = 10;
/// Attempt budget per job; exhausting it parks the job as failed instead
/// of retrying forever.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Upload,
    Download,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Upload => "upload",
            JobKind::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(JobKind::Upload),
            "download" => Some(JobKind::Download),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One durable attachment transfer, persisted across restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    pub id: i64,
    pub kind: JobKind,
    pub attachment_id: i64,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("api error: {0}")]
    Api(#[from] QuillError),
    #[error("cache path error: {0}")]
    Cache(#[from] CachePathError),
    #[error("attachment {0} no longer exists")]
    MissingAttachment(i64),
    #[error("attachment {0} has no server id to download from")]
    MissingServerId(i64),
    #[error("attachment {0} has no client id to upload under")]
    MissingClientId(i64),
}

impl JobError {
    fn is_auth(&self) -> bool {
        match self {
            JobError::Transfer(err) => err.is_auth(),
            JobError::Api(err) => err.is_auth(),
            _ => false,
        }
    }
}

/// Executes transfer jobs claimed from the store. Several workers may run
/// `run_once` concurrently; the claim update in the store arbitrates.
pub struct JobQueue {
    store: RecordStore,
    client: QuillClient,
    transfer: TransferClient,
    cache_root: PathBuf,
    auth: AuthState,
    backoff: Backoff,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(
        store: RecordStore,
        client: QuillClient,
        transfer: TransferClient,
        cache_root: PathBuf,
        auth: AuthState,
    ) -> Self {
        Self {
            store,
            client,
            transfer,
            cache_root,
            auth,
            backoff: Backoff::for_transfers(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn enqueue_upload(&self, attachment_id: i64) -> Result<(), JobError> {
        self.store
            .get_attachment(attachment_id)
            .await?
            .ok_or(JobError::MissingAttachment(attachment_id))?;
        self.store
            .enqueue_transfer_job(JobKind::Upload, attachment_id, DEFAULT_UPLOAD_PRIORITY)
            .await?;
        Ok(())
    }

    /// Priority rises with how directly the user asked for the blob:
    /// opening an attachment enqueues far above background prefetch.
    pub async fn enqueue_download(&self, attachment_id: i64, priority: i64) -> Result<(), JobError> {
        self.store
            .get_attachment(attachment_id)
            .await?
            .ok_or(JobError::MissingAttachment(attachment_id))?;
        self.store
            .enqueue_transfer_job(JobKind::Download, attachment_id, priority)
            .await?;
        Ok(())
    }

    /// Claims and executes at most one eligible job. Returns whether a job
    /// was claimed, so worker loops can idle when the queue drains.
    pub async fn run_once(&self) -> Result<bool, JobError> {
        if self.auth.is_required() {
            return Ok(false);
        }
        let Some(job) = self.store.claim_transfer_job(now_ms()).await? else {
            return Ok(false);
        };

        let result = match job.kind {
            JobKind::Upload => self.execute_upload(&job).await,
            JobKind::Download => self.execute_download(&job).await,
        };

        match result {
            Ok(()) => {
                self.store.complete_transfer_job(job.id).await?;
                tracing::info!(
                    job = job.id,
                    kind = job.kind.as_str(),
                    attachment = job.attachment_id,
                    "transfer job completed"
                );
            }
            Err(err) => {
                if err.is_auth() {
                    self.auth.set_required();
                }
                let attempt = u32::try_from(job.attempts).unwrap_or(0).saturating_add(1);
                let retry_at = self.backoff.retry_at_ms(attempt);
                let status = self
                    .store
                    .fail_transfer_job(&job, retry_at, &err.to_string(), self.max_attempts)
                    .await?;
                match status {
                    JobStatus::Failed => tracing::warn!(
                        job = job.id,
                        kind = job.kind.as_str(),
                        attachment = job.attachment_id,
                        error = %err,
                        "transfer job failed permanently"
                    ),
                    _ => tracing::debug!(
                        job = job.id,
                        retry_at_ms = retry_at,
                        error = %err,
                        "transfer job will be retried"
                    ),
                }
            }
        }
        Ok(true)
    }

    async fn execute_upload(&self, job: &TransferJob) -> Result<(), JobError> {
        let attachment = self
            .store
            .get_attachment(job.attachment_id)
            .await?
            .ok_or(JobError::MissingAttachment(job.attachment_id))?;
        let client_id = attachment
            .meta
            .client_id
            .clone()
            .ok_or(JobError::MissingClientId(job.attachment_id))?;
        let source = blob_path_for(&self.cache_root, &attachment)?;
        let url = self.client.attachment_upload_url(&client_id)?;

        // keyed by client id server-side, so a crashed-and-retried upload
        // lands on the same blob
        let uploaded = self
            .transfer
            .upload_from_path(url.as_str(), &source, &attachment.mime_type)
            .await?;
        self.store
            .apply_mapping(Resource::Attachment, &client_id, uploaded.id)
            .await?;
        Ok(())
    }

    async fn execute_download(&self, job: &TransferJob) -> Result<(), JobError> {
        let attachment = self
            .store
            .get_attachment(job.attachment_id)
            .await?
            .ok_or(JobError::MissingAttachment(job.attachment_id))?;
        let server_id = attachment
            .meta
            .server_id
            .ok_or(JobError::MissingServerId(job.attachment_id))?;
        let target = blob_path_for(&self.cache_root, &attachment)?;
        let url = self.client.attachment_download_url(server_id)?;

        self.transfer.download_to_path(url.as_str(), &target).await?;
        self.store
            .set_blob_cached(attachment.meta.local_id, true)
            .await?;
        Ok(())
    }

    pub async fn failed_count(&self) -> Result<i64, JobError> {
        Ok(self.store.failed_job_count().await?)
    }

    pub async fn retry_failed(&self) -> Result<u64, JobError> {
        Ok(self.store.retry_failed_jobs().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::QuillClient;
    use sqlx::SqlitePool;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_store() -> RecordStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = RecordStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn make_queue(store: RecordStore, server: &MockServer, cache_root: PathBuf) -> JobQueue {
        let client = QuillClient::new(&server.uri(), "t").unwrap();
        let transfer = TransferClient::new("t");
        JobQueue::new(store, client, transfer, cache_root, AuthState::default())
            .with_backoff(Backoff::new_ms(0, 0, false))
            .with_max_attempts(2)
    }

    /// Store fixture: one identified note with one local attachment whose
    /// blob is already in the cache.
    async fn seed_attachment(store: &RecordStore, cache_root: &std::path::Path) -> (i64, String) {
        let space = store.create_space("Journal").await.unwrap();
        let note = store.create_note(space.meta.local_id, "n", &[], None).await.unwrap();
        store
            .apply_mapping(Resource::Note, &note.meta.client_id.clone().unwrap(), 42)
            .await
            .unwrap();
        let attachment = store
            .create_attachment(note.meta.local_id, "a.jpg", "image/jpeg", 7)
            .await
            .unwrap();
        let client_id = attachment.meta.client_id.clone().unwrap();
        std::fs::write(cache_root.join(&client_id), b"payload").unwrap();
        (attachment.meta.local_id, client_id)
    }

    #[tokio::test]
    async fn upload_job_streams_the_blob_and_maps_the_server_id() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let (attachment_id, client_id) = seed_attachment(&store, dir.path()).await;

        Mock::given(method("PUT"))
            .and(path("/attachments/blob"))
            .and(query_param("client_id", client_id.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 9})))
            .mount(&server)
            .await;

        let queue = make_queue(store.clone(), &server, dir.path().to_path_buf());
        queue.enqueue_upload(attachment_id).await.unwrap();

        assert!(queue.run_once().await.unwrap());
        let attachment = store.get_attachment(attachment_id).await.unwrap().unwrap();
        assert_eq!(attachment.meta.server_id, Some(9));
        // queue drained
        assert!(!queue.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn download_job_fills_the_cache_and_marks_the_row() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let (attachment_id, client_id) = seed_attachment(&store, dir.path()).await;
        std::fs::remove_file(dir.path().join(&client_id)).unwrap();
        store
            .apply_mapping(Resource::Attachment, &client_id, 9)
            .await
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/attachments/9/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"blobbytes"))
            .mount(&server)
            .await;

        let queue = make_queue(store.clone(), &server, dir.path().to_path_buf());
        queue.enqueue_download(attachment_id, 10).await.unwrap();

        assert!(queue.run_once().await.unwrap());
        assert_eq!(
            std::fs::read(dir.path().join(&client_id)).unwrap(),
            b"blobbytes"
        );
        let attachment = store.get_attachment(attachment_id).await.unwrap().unwrap();
        assert!(attachment.blob_cached);
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_the_attempt_budget() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let (attachment_id, _) = seed_attachment(&store, dir.path()).await;

        Mock::given(method("PUT"))
            .and(path("/attachments/blob"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let queue = make_queue(store.clone(), &server, dir.path().to_path_buf());
        queue.enqueue_upload(attachment_id).await.unwrap();

        assert!(queue.run_once().await.unwrap());
        assert_eq!(queue.failed_count().await.unwrap(), 0);
        assert!(queue.run_once().await.unwrap());
        assert_eq!(queue.failed_count().await.unwrap(), 1);
        // a failed job is parked, not retried
        assert!(!queue.run_once().await.unwrap());

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        assert!(queue.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn auth_rejection_suspends_the_worker() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let (attachment_id, _) = seed_attachment(&store, dir.path()).await;

        Mock::given(method("PUT"))
            .and(path("/attachments/blob"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = AuthState::default();
        let client = QuillClient::new(&server.uri(), "t").unwrap();
        let transfer = TransferClient::new("t");
        let queue = JobQueue::new(
            store.clone(),
            client,
            transfer,
            dir.path().to_path_buf(),
            auth.clone(),
        )
        .with_backoff(Backoff::new_ms(0, 0, false));
        queue.enqueue_upload(attachment_id).await.unwrap();

        assert!(queue.run_once().await.unwrap());
        assert!(auth.is_required());
        // nothing is claimed while re-authentication is pending
        assert!(!queue.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn upload_waits_for_the_owning_note_identity() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let store = make_store().await;
        let space = store.create_space("Journal").await.unwrap();
        let note = store.create_note(space.meta.local_id, "n", &[], None).await.unwrap();
        let attachment = store
            .create_attachment(note.meta.local_id, "a.jpg", "image/jpeg", 7)
            .await
            .unwrap();
        let client_id = attachment.meta.client_id.clone().unwrap();
        std::fs::write(dir.path().join(&client_id), b"payload").unwrap();

        Mock::given(method("PUT"))
            .and(path("/attachments/blob"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 9})))
            .mount(&server)
            .await;

        let queue = make_queue(store.clone(), &server, dir.path().to_path_buf());
        queue.enqueue_upload(attachment.meta.local_id).await.unwrap();

        // dependency not met: the job stays queued untouched
        assert!(!queue.run_once().await.unwrap());

        store
            .apply_mapping(Resource::Note, &note.meta.client_id.clone().unwrap(), 42)
            .await
            .unwrap();
        assert!(queue.run_once().await.unwrap());
        let attachment = store
            .get_attachment(attachment.meta.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attachment.meta.server_id, Some(9));
    }
}
