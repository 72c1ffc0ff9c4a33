use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blobmirror_core::{BlobStoreClient, DEFAULT_PAGE_SIZE};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::batch::{BatchSettings, DEFAULT_MAX_BATCH_ITEMS, DEFAULT_MAX_BATCH_WAIT};
use crate::sync::cache::CacheStore;
use crate::sync::engine::{
    DEFAULT_FLUSH_CONCURRENCY, DEFAULT_UPLOAD_STALENESS, EngineFactory, PassSummary, SyncSettings,
};
use crate::sync::events::{FailureCause, QueueEvent, QueuedWork};
use crate::sync::queue::QueueManager;
use crate::sync::remote::{HttpRemoteStore, RemoteStore};
use crate::sync::scheduler::{DEFAULT_SYNC_PERIOD, Scheduler, SchedulerSettings};
use crate::sync::worker::{QueueWorker, SyncLock};

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub endpoint: String,
    pub token: String,
    pub db_path: PathBuf,
    pub page_size: u32,
    pub scheduler: SchedulerSettings,
    pub sync: SyncSettings,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint =
            std::env::var("BLOBMIRROR_ENDPOINT").context("BLOBMIRROR_ENDPOINT is not set")?;
        let token = std::env::var("BLOBMIRROR_TOKEN").context("BLOBMIRROR_TOKEN is not set")?;
        let db_path = match std::env::var("BLOBMIRROR_DB_PATH") {
            Ok(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Err(_) => default_db_path(),
        };
        let page_size = u32::try_from(read_u64_env(
            "BLOBMIRROR_PAGE_SIZE",
            u64::from(DEFAULT_PAGE_SIZE),
        ))
        .unwrap_or(DEFAULT_PAGE_SIZE);
        let scheduler = SchedulerSettings {
            period: Duration::from_secs(read_u64_env(
                "BLOBMIRROR_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_PERIOD.as_secs(),
            )),
            auto_start: read_bool_env("BLOBMIRROR_AUTO_START", true),
        };
        let sync = SyncSettings {
            batch: BatchSettings {
                max_items: read_usize_env("BLOBMIRROR_BATCH_SIZE", DEFAULT_MAX_BATCH_ITEMS),
                max_wait: Duration::from_millis(read_u64_env(
                    "BLOBMIRROR_BATCH_MS",
                    millis(DEFAULT_MAX_BATCH_WAIT),
                )),
            },
            flush_concurrency: read_usize_env(
                "BLOBMIRROR_FLUSH_CONCURRENCY",
                DEFAULT_FLUSH_CONCURRENCY,
            ),
            upload_staleness: Duration::from_secs(read_u64_env(
                "BLOBMIRROR_UPLOAD_STALE_SECS",
                DEFAULT_UPLOAD_STALENESS.as_secs(),
            )),
        };

        Ok(Self {
            endpoint,
            token,
            db_path,
            page_size,
            scheduler,
            sync,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    cache: CacheStore,
    worker: QueueWorker,
    queue: QueueManager,
    scheduler: Scheduler,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let cache = CacheStore::new_at(&config.db_path)
            .await
            .with_context(|| format!("failed to open cache at {}", config.db_path.display()))?;
        let client = BlobStoreClient::with_base_url(&config.endpoint, config.token.clone())
            .with_context(|| format!("invalid object store endpoint {}", config.endpoint))?;
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(client, config.page_size));

        Ok(Self::assemble(config, cache, remote))
    }

    pub fn assemble(config: DaemonConfig, cache: CacheStore, remote: Arc<dyn RemoteStore>) -> Self {
        let factory = EngineFactory::new(remote, cache.pool().clone(), config.sync);
        let worker = QueueWorker::new(SyncLock::new(), factory);
        let queue = QueueManager::new(Arc::new(worker.clone()));
        let scheduler = Scheduler::new(queue.clone(), config.scheduler);
        Self {
            config,
            cache,
            worker,
            queue,
            scheduler,
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            endpoint = %self.config.endpoint,
            db_path = %self.config.db_path.display(),
            period_secs = self.config.scheduler.period.as_secs(),
            "blobmirrord started"
        );

        let events = self.queue.subscribe();
        let log_handle = tokio::spawn(log_queue_events(events));

        self.scheduler
            .start()
            .await
            .context("failed to start sync scheduler")?;

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested, waiting for the current sync pass");

        self.scheduler.stop();
        self.queue.stop_queue_graceful().await;
        self.queue.shutdown().await;
        log_handle.abort();
        Ok(())
    }

    pub async fn run_once(&self) -> anyhow::Result<PassSummary> {
        let work = QueuedWork::new();
        self.worker
            .run_pass(&work, &CancellationToken::new())
            .await
            .context("sync pass failed")
    }
}

async fn log_queue_events(mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::Finished { work, summary }) => info!(
                work_id = %work.id,
                containers = summary.containers,
                blobs = summary.blobs,
                evicted_blobs = summary.evicted_blobs,
                "cache refreshed"
            ),
            Ok(QueueEvent::Errored {
                work,
                cause: FailureCause::Cancelled,
            }) => info!(work_id = %work.id, "cache refresh cancelled"),
            Ok(event) => debug!(event = event.kind(), "queue event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "queue event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
