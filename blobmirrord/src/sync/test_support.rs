use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobmirror_core::{BlobProperties, ContainerProperties};
use futures_util::stream::{self, StreamExt};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::cache::CacheStore;
use super::remote::{RemoteError, RemoteStore, RemoteStream};

// Single connection, otherwise every pooled connection gets its own database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

pub async fn memory_store() -> CacheStore {
    let store = CacheStore::from_pool(memory_pool().await);
    store.init().await.unwrap();
    store
}

pub fn container(name: &str) -> ContainerProperties {
    ContainerProperties {
        name: name.to_string(),
        etag: Some(format!("\"{name}-etag\"")),
        ..Default::default()
    }
}

pub fn blob(name: &str, size: u64) -> BlobProperties {
    BlobProperties {
        name: name.to_string(),
        content_length: size,
        content_type: Some("application/octet-stream".into()),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeRemote {
    namespace: Mutex<Vec<(ContainerProperties, Vec<BlobProperties>)>>,
    failing: Mutex<HashSet<String>>,
    blob_delay: Mutex<Duration>,
    active_listings: Arc<AtomicUsize>,
    max_active_listings: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn with_container(self, name: &str, blobs: &[(&str, u64)]) -> Self {
        self.put_container(name, blobs);
        self
    }

    pub fn put_container(&self, name: &str, blobs: &[(&str, u64)]) {
        let blobs: Vec<_> = blobs.iter().map(|(b, size)| blob(b, *size)).collect();
        let mut namespace = self.namespace.lock().unwrap();
        if let Some(entry) = namespace.iter_mut().find(|(c, _)| c.name == name) {
            entry.1 = blobs;
        } else {
            namespace.push((container(name), blobs));
        }
    }

    pub fn set_blobs(&self, container_name: &str, blobs: Vec<BlobProperties>) {
        let mut namespace = self.namespace.lock().unwrap();
        if let Some(entry) = namespace.iter_mut().find(|(c, _)| c.name == container_name) {
            entry.1 = blobs;
        } else {
            namespace.push((container(container_name), blobs));
        }
    }

    pub fn remove_container(&self, name: &str) {
        self.namespace.lock().unwrap().retain(|(c, _)| c.name != name);
    }

    // The blob listing yields its first blob, then fails.
    pub fn fail_listing_of(&self, container_name: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(container_name.to_string());
    }

    pub fn set_blob_delay(&self, delay: Duration) {
        *self.blob_delay.lock().unwrap() = delay;
    }

    pub fn max_concurrent_listings(&self) -> usize {
        self.max_active_listings.load(Ordering::SeqCst)
    }
}

struct ListingGuard(Arc<AtomicUsize>);

impl Drop for ListingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteStore for FakeRemote {
    fn list_containers(&self) -> RemoteStream<'_, ContainerProperties> {
        let now = self.active_listings.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_listings.fetch_max(now, Ordering::SeqCst);
        let guard = ListingGuard(Arc::clone(&self.active_listings));
        let containers: Vec<_> = self
            .namespace
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect();
        stream::iter(containers)
            .map(move |c| {
                let _held = &guard;
                Ok(c)
            })
            .boxed()
    }

    fn list_blobs<'a>(&'a self, container: &'a str) -> RemoteStream<'a, BlobProperties> {
        let blobs: Vec<_> = self
            .namespace
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.name == container)
            .map(|(_, blobs)| blobs.clone())
            .unwrap_or_default();
        let delay = *self.blob_delay.lock().unwrap();
        let mut items: Vec<Result<BlobProperties, RemoteError>> = Vec::new();
        if self.failing.lock().unwrap().contains(container) {
            items.extend(blobs.into_iter().take(1).map(Ok));
            items.push(Err(RemoteError::Unavailable(format!(
                "listing of {container} interrupted"
            ))));
        } else {
            items.extend(blobs.into_iter().map(Ok));
        }
        stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}
