use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quill_core::QuillClient;

use crate::sync::engine::{AuthState, SyncEngine};
use crate::sync::jobs::JobQueue;
use crate::sync::store::RecordStore;
use crate::sync::transfer::TransferClient;
use crate::sync::trigger::{SyncSignal, run_nudge_listener, spawn_timer, trigger_channel};

const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_WORKER_LOOP_MS: u64 = 500;
const DEFAULT_JOB_CONCURRENCY: u64 = 2;
const DEFAULT_JOB_MAX_ATTEMPTS: u64 = 5;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub token: String,
    pub database_path: Option<PathBuf>,
    pub cache_root: PathBuf,
    pub poll_interval: Duration,
    pub worker_interval: Duration,
    pub job_concurrency: usize,
    pub job_max_attempts: u32,
    pub nudge_addr: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server_url =
            std::env::var("QUILL_SERVER_URL").context("QUILL_SERVER_URL is not set")?;
        let token = std::env::var("QUILL_TOKEN").context("QUILL_TOKEN is not set")?;
        let database_path = std::env::var("QUILL_DB_PATH").ok().map(PathBuf::from);
        let cache_root = match std::env::var("QUILL_CACHE_DIR") {
            Ok(value) => PathBuf::from(value),
            Err(_) => default_cache_root().context("cache directory is unavailable")?,
        };
        let poll_interval =
            Duration::from_secs(read_u64_env("QUILL_POLL_SECS", DEFAULT_POLL_SECS));
        let worker_interval = Duration::from_millis(read_u64_env(
            "QUILL_WORKER_LOOP_MS",
            DEFAULT_WORKER_LOOP_MS,
        ));
        let job_concurrency =
            read_u64_env("QUILL_JOB_CONCURRENCY", DEFAULT_JOB_CONCURRENCY).max(1) as usize;
        let job_max_attempts =
            read_u64_env("QUILL_JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS).max(1) as u32;
        let nudge_addr = std::env::var("QUILL_NUDGE_ADDR").ok();

        Ok(Self {
            server_url,
            token,
            database_path,
            cache_root,
            poll_interval,
            worker_interval,
            job_concurrency,
            job_max_attempts,
            nudge_addr,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    jobs: Arc<JobQueue>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;

        let store = match &config.database_path {
            Some(path) => RecordStore::open(path).await,
            None => RecordStore::new_default().await,
        }
        .context("failed to open the record store")?;

        let recovered = store
            .reset_stale_running_jobs()
            .await
            .context("failed to recover stale transfer jobs")?;
        if recovered > 0 {
            tracing::info!(recovered, "re-queued transfer jobs interrupted by shutdown");
        }

        let client = QuillClient::new(&config.server_url, config.token.clone())?;
        let auth = AuthState::default();
        let engine = Arc::new(SyncEngine::new(client.clone(), store.clone(), auth.clone()));
        let jobs = Arc::new(
            JobQueue::new(
                store,
                client,
                TransferClient::new(&config.token),
                config.cache_root.clone(),
                auth,
            )
            .with_max_attempts(config.job_max_attempts),
        );

        Ok(Self { config, engine, jobs })
    }

    /// Long-running mode: trigger coordinator, poll timer, transfer
    /// workers and the optional nudge socket, until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            server = %self.config.server_url,
            cache = %self.config.cache_root.display(),
            workers = self.config.job_concurrency,
            "quilld started"
        );

        let (handle, coordinator) = trigger_channel(Arc::clone(&self.engine));
        let coordinator_handle = tokio::spawn(coordinator.run());
        let timer_handle = spawn_timer(handle.clone(), self.config.poll_interval);

        let mut worker_handles = Vec::with_capacity(self.config.job_concurrency);
        for worker in 0..self.config.job_concurrency {
            let jobs = Arc::clone(&self.jobs);
            let worker_interval = self.config.worker_interval;
            worker_handles.push(tokio::spawn(async move {
                loop {
                    match jobs.run_once().await {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(worker_interval).await,
                        Err(err) => {
                            tracing::warn!(worker, error = %err, "transfer worker error");
                            tokio::time::sleep(worker_interval).await;
                        }
                    }
                }
            }));
        }

        let nudge_handle = self.config.nudge_addr.clone().map(|addr| {
            let handle = handle.clone();
            let token = self.config.token.clone();
            tokio::spawn(async move {
                loop {
                    match run_nudge_listener(&addr, &token, handle.clone()).await {
                        Ok(()) => tracing::info!(addr = %addr, "nudge socket closed, reconnecting"),
                        Err(err) => tracing::warn!(addr = %addr, error = %err, "nudge socket error"),
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            })
        });

        handle.request(SyncSignal::Manual);

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");

        coordinator_handle.abort();
        timer_handle.abort();
        for handle in worker_handles {
            handle.abort();
        }
        if let Some(handle) = nudge_handle {
            handle.abort();
        }
        Ok(())
    }

    /// One sync cycle plus a full drain of the transfer queue, for cron
    /// jobs and scripting.
    pub async fn run_once(self) -> anyhow::Result<()> {
        let outcome = self.engine.run_sync_cycle().await;
        tracing::info!(
            pushed = outcome.pushed,
            pulled = outcome.pulled,
            errors = outcome.errors,
            "sync cycle finished"
        );
        loop {
            match self.jobs.run_once().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "transfer worker error");
                    break;
                }
            }
        }
        let failed = self.jobs.failed_count().await?;
        if failed > 0 {
            tracing::warn!(failed, "transfer jobs are parked as failed");
        }
        Ok(())
    }
}

fn default_cache_root() -> Option<PathBuf> {
    let mut path = dirs::cache_dir()?;
    path.push("quill");
    path.push("blobs");
    Some(path)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}
