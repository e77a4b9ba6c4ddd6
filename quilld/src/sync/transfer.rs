use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("upload rejected with {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl TransferError {
    pub fn is_auth(&self) -> bool {
        let status = match self {
            TransferError::Request(err) => err.status(),
            TransferError::Api { status, .. } => Some(*status),
            _ => None,
        };
        matches!(
            status,
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    }
}

/// The blob id assigned by the server on a successful upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedBlob {
    pub id: i64,
}

/// Streams attachment payloads without buffering whole files, with
/// per-direction concurrency caps.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    bearer: String,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("QUILL_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("QUILL_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferClient {
    pub fn new(token: &str) -> Self {
        Self::with_config(token, TransferConfig::default())
    }

    pub fn with_config(token: &str, config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            bearer: format!("Bearer {token}"),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Downloads into `<target>.partial`, then renames: the target path
    /// either holds the complete blob or does not exist.
    pub async fn download_to_path(&self, href: &str, target: &Path) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, &self.bearer)
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;

        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    pub async fn upload_from_path(
        &self,
        href: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<UploadedBlob, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, &self.bearer)
            .header(header::CONTENT_TYPE, mime_type)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransferError::Api { status, body })
        }
    }

}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
