use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use blobmirror_core::BlobProperties;
use futures_util::future;
use futures_util::stream::{StreamExt, TryStreamExt};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::batch::{BatchSettings, batched};
use super::cache::{CacheError, CacheStore, unix_seconds};
use super::remote::{RemoteError, RemoteStore};

pub const DEFAULT_FLUSH_CONCURRENCY: usize = 1;
pub const DEFAULT_UPLOAD_STALENESS: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("sync pass cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch: BatchSettings,
    pub flush_concurrency: usize,
    pub upload_staleness: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            flush_concurrency: DEFAULT_FLUSH_CONCURRENCY,
            upload_staleness: DEFAULT_UPLOAD_STALENESS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub token: VersionToken,
    pub containers: u64,
    pub blobs: u64,
    pub evicted_containers: u64,
    pub evicted_blobs: u64,
    pub stale_uploads: u64,
}

#[derive(Default)]
struct BlobTotals {
    count: AtomicU64,
    size: AtomicU64,
}

impl BlobTotals {
    fn record(&self, batch: &[BlobProperties]) {
        let size = batch
            .iter()
            .fold(0u64, |acc, blob| acc.saturating_add(blob.content_length));
        self.count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.size.fetch_add(size, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.count.load(Ordering::Relaxed),
            self.size.load(Ordering::Relaxed),
        )
    }
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    cache: CacheStore,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: CacheStore, settings: SyncSettings) -> Self {
        Self {
            remote,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Any failure aborts the pass before eviction, so rows written so far
    /// stay in place until the next successful pass reconciles them.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PassSummary, EngineError> {
        let token = VersionToken::mint();
        let started = Instant::now();
        info!(token = %token, "sync pass started");

        let mut containers_seen = 0u64;
        let mut blobs_seen = 0u64;
        let mut containers = self.remote.list_containers();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = containers.next() => next,
            };
            let Some(container) = next else {
                break;
            };
            let container = container?;

            self.cache
                .upsert_container(&container, token.as_str())
                .await?;
            let (count, size) = self
                .sync_container_blobs(&container.name, &token, cancel)
                .await?;
            self.cache
                .set_container_totals(&container.name, count, size)
                .await?;
            debug!(container = %container.name, blobs = count, bytes = size, "container synced");

            containers_seen += 1;
            blobs_seen += count;
        }
        drop(containers);

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let evicted = self.cache.delete_where_token_not(token.as_str()).await?;
        let cutoff = unix_seconds(SystemTime::now())
            .saturating_sub(i64::try_from(self.settings.upload_staleness.as_secs()).unwrap_or(i64::MAX));
        let stale_uploads = self.cache.delete_stale_uploads(cutoff).await?;

        let summary = PassSummary {
            token,
            containers: containers_seen,
            blobs: blobs_seen,
            evicted_containers: evicted.containers,
            evicted_blobs: evicted.blobs,
            stale_uploads,
        };
        info!(
            token = %summary.token,
            containers = summary.containers,
            blobs = summary.blobs,
            evicted_containers = summary.evicted_containers,
            evicted_blobs = summary.evicted_blobs,
            stale_uploads = summary.stale_uploads,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync pass finished"
        );
        Ok(summary)
    }

    async fn sync_container_blobs(
        &self,
        container: &str,
        token: &VersionToken,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64), EngineError> {
        let totals = BlobTotals::default();
        let totals_ref = &totals;
        let pipeline = batched(self.remote.list_blobs(container), self.settings.batch)
            .map(move |batch| self.flush_batch(container, token, batch, totals_ref, cancel))
            .buffer_unordered(self.settings.flush_concurrency.max(1))
            .try_for_each(|()| future::ready(Ok(())));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = pipeline => result?,
        }
        Ok(totals.snapshot())
    }

    async fn flush_batch(
        &self,
        container: &str,
        token: &VersionToken,
        batch: Result<Vec<BlobProperties>, RemoteError>,
        totals: &BlobTotals,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let batch = batch?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let written = self
            .cache
            .upsert_blobs(container, &batch, token.as_str())
            .await?;
        totals.record(&batch);
        debug!(container = %container, written, "blob batch flushed");
        Ok(())
    }
}

#[derive(Clone)]
pub struct EngineFactory {
    remote: Arc<dyn RemoteStore>,
    pool: SqlitePool,
    settings: SyncSettings,
}

impl EngineFactory {
    pub fn new(remote: Arc<dyn RemoteStore>, pool: SqlitePool, settings: SyncSettings) -> Self {
        Self {
            remote,
            pool,
            settings,
        }
    }

    pub fn create(&self) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(&self.remote),
            CacheStore::from_pool(self.pool.clone()),
            self.settings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::{FakeRemote, blob, container, memory_store};

    fn engine(remote: &Arc<FakeRemote>, cache: &CacheStore) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(remote) as Arc<dyn RemoteStore>,
            cache.clone(),
            SyncSettings::default(),
        )
    }

    async fn blob_names(cache: &CacheStore, container: &str) -> Vec<String> {
        cache
            .list_blobs(container)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect()
    }

    #[tokio::test]
    async fn second_pass_reflects_upstream_additions_and_deletions() {
        let cache = memory_store().await;
        let remote = Arc::new(
            FakeRemote::default()
                .with_container("A", &[("a1", 1), ("a2", 2)])
                .with_container("B", &[("b1", 5)]),
        );
        let cancel = CancellationToken::new();

        let first = engine(&remote, &cache).run(&cancel).await.unwrap();
        assert_eq!((first.containers, first.blobs), (2, 3));
        let a = cache.get_container("A").await.unwrap().unwrap();
        let b = cache.get_container("B").await.unwrap().unwrap();
        assert_eq!(a.blob_count, 2);
        assert_eq!(b.blob_count, 1);

        remote.remove_container("B");
        remote.put_container("A", &[("a1", 1), ("a2", 2), ("a3", 3)]);
        let second = engine(&remote, &cache).run(&cancel).await.unwrap();

        assert_eq!(second.evicted_containers, 1);
        assert_eq!(second.evicted_blobs, 1);
        let containers = cache.list_containers().await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "A");
        assert_eq!(containers[0].blob_count, 3);
        assert_eq!(blob_names(&cache, "A").await, vec!["a1", "a2", "a3"]);
        assert!(cache.list_blobs("B").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn eviction_removes_rows_from_older_tokens_and_keeps_identity_of_survivors() {
        let cache = memory_store().await;
        cache
            .upsert_container(&container("stale"), "old")
            .await
            .unwrap();
        cache
            .upsert_blobs("stale", &[blob("ghost", 9)], "old")
            .await
            .unwrap();
        let kept = cache
            .upsert_container(&container("kept"), "old")
            .await
            .unwrap();
        cache
            .upsert_blobs("kept", &[blob("k", 1)], "old")
            .await
            .unwrap();
        let kept_blob = cache.get_blob("kept", "k").await.unwrap().unwrap();

        let remote = Arc::new(FakeRemote::default().with_container("kept", &[("k", 10)]));
        let summary = engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert!(cache.get_container("stale").await.unwrap().is_none());
        assert!(cache.get_blob("stale", "ghost").await.unwrap().is_none());
        let refreshed = cache.get_container("kept").await.unwrap().unwrap();
        assert_eq!(refreshed.id, kept.id);
        assert_eq!(refreshed.cache_copy_id, summary.token.as_str());
        let refreshed_blob = cache.get_blob("kept", "k").await.unwrap().unwrap();
        assert_eq!(refreshed_blob.id, kept_blob.id);
        assert_eq!(refreshed_blob.content_length, 10);
        assert_eq!(refreshed_blob.cache_copy_id, summary.token.as_str());
    }

    #[tokio::test]
    async fn aggregates_match_cached_blob_rows() {
        let cache = memory_store().await;
        let remote = Arc::new(FakeRemote::default().with_container("big", &[]));
        let blobs: Vec<_> = (0..250u64).map(|i| blob(&format!("b{i:03}"), i)).collect();
        remote.set_blobs("big", blobs);
        remote.put_container("small", &[("x", 7), ("y", 8)]);

        engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        for container in cache.list_containers().await.unwrap() {
            let rows = cache.list_blobs(&container.name).await.unwrap();
            assert_eq!(container.blob_count, rows.len() as i64);
            assert_eq!(
                container.total_size,
                rows.iter().map(|b| b.content_length).sum::<i64>()
            );
        }
        let big = cache.get_container("big").await.unwrap().unwrap();
        assert_eq!(big.blob_count, 250);
        assert_eq!(big.total_size, (0..250).sum::<i64>());
    }

    #[tokio::test]
    async fn concurrent_flushes_keep_totals_exact() {
        let cache = memory_store().await;
        let remote = Arc::new(FakeRemote::default().with_container("c", &[]));
        remote.set_blobs("c", (0..95u64).map(|i| blob(&format!("n{i}"), 2)).collect());
        let settings = SyncSettings {
            batch: BatchSettings {
                max_items: 10,
                max_wait: Duration::from_millis(500),
            },
            flush_concurrency: 4,
            ..SyncSettings::default()
        };

        SyncEngine::new(remote as Arc<dyn RemoteStore>, cache.clone(), settings)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let record = cache.get_container("c").await.unwrap().unwrap();
        assert_eq!((record.blob_count, record.total_size), (95, 190));
    }

    #[tokio::test]
    async fn failed_container_aborts_pass_without_evicting() {
        let cache = memory_store().await;
        let remote = Arc::new(
            FakeRemote::default()
                .with_container("A", &[("a1", 1)])
                .with_container("B", &[("b1", 1)]),
        );
        engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        remote.remove_container("B");
        remote.put_container("A", &[("a1", 1), ("a2", 2)]);
        remote.put_container("C", &[("c1", 1), ("c2", 2)]);
        remote.fail_listing_of("C");
        let err = engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Remote(RemoteError::Unavailable(_))));
        // B survives because eviction never ran; A already carries the new rows.
        assert!(cache.get_container("B").await.unwrap().is_some());
        assert_eq!(blob_names(&cache, "A").await, vec!["a1", "a2"]);
        assert!(cache.get_container("C").await.unwrap().is_some());

        let fixed = Arc::new(
            FakeRemote::default()
                .with_container("A", &[("a1", 1), ("a2", 2)])
                .with_container("C", &[("c1", 1), ("c2", 2)]),
        );
        engine(&fixed, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert!(cache.get_container("B").await.unwrap().is_none());
        assert_eq!(blob_names(&cache, "C").await, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_writing() {
        let cache = memory_store().await;
        let remote = Arc::new(FakeRemote::default().with_container("A", &[("a1", 1)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(&remote, &cache).run(&cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(cache.list_containers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_blob_stream_stops_the_pass() {
        let cache = memory_store().await;
        let remote = Arc::new(FakeRemote::default().with_container("A", &[("a1", 1), ("a2", 1)]));
        remote.set_blob_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = engine(&remote, &cache).run(&cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(cache.list_blobs("A").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pass_sweeps_stale_upload_sessions() {
        let cache = memory_store().await;
        let now = unix_seconds(SystemTime::now());
        cache
            .record_upload_activity("stale", "A", "big.bin", now - 16 * 60)
            .await
            .unwrap();
        cache.add_upload_block("stale", "blk-1", 4).await.unwrap();
        cache
            .record_upload_activity("fresh", "A", "new.bin", now - 60)
            .await
            .unwrap();
        let remote = Arc::new(FakeRemote::default().with_container("A", &[]));

        let summary = engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.stale_uploads, 1);
        assert!(cache.get_upload_session("stale").await.unwrap().is_none());
        assert_eq!(cache.count_upload_blocks("stale").await.unwrap(), 0);
        assert!(cache.get_upload_session("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_namespace_evicts_everything() {
        let cache = memory_store().await;
        cache
            .upsert_container(&container("old"), "t0")
            .await
            .unwrap();
        let remote = Arc::new(FakeRemote::default());

        let summary = engine(&remote, &cache)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.containers, 0);
        assert_eq!(summary.evicted_containers, 1);
        assert!(cache.list_containers().await.unwrap().is_empty());
    }

    #[test]
    fn version_tokens_are_unique() {
        assert_ne!(VersionToken::mint(), VersionToken::mint());
    }

    #[tokio::test]
    async fn factory_creates_independent_engines_over_one_pool() {
        let cache = memory_store().await;
        let remote = Arc::new(FakeRemote::default().with_container("A", &[("a1", 1)]));
        let factory = EngineFactory::new(
            remote as Arc<dyn RemoteStore>,
            cache.pool().clone(),
            SyncSettings::default(),
        );

        let first = factory.create().run(&CancellationToken::new()).await.unwrap();
        let second = factory.create().run(&CancellationToken::new()).await.unwrap();

        assert_ne!(first.token, second.token);
        let record = cache.get_container("A").await.unwrap().unwrap();
        assert_eq!(record.cache_copy_id, second.token.as_str());
    }
}
