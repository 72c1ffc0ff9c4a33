use blobmirror_core::{BlobProperties, BlobStoreClient, BlobStoreError, ContainerProperties};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("object store error: {0}")]
    Client(#[from] BlobStoreError),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

pub type RemoteStream<'a, T> = BoxStream<'a, Result<T, RemoteError>>;

/// Both listings are lazy and may fail at any point during enumeration.
pub trait RemoteStore: Send + Sync {
    fn list_containers(&self) -> RemoteStream<'_, ContainerProperties>;

    fn list_blobs<'a>(&'a self, container: &'a str) -> RemoteStream<'a, BlobProperties>;
}

#[derive(Clone)]
pub struct HttpRemoteStore {
    client: BlobStoreClient,
    page_size: u32,
}

impl HttpRemoteStore {
    pub fn new(client: BlobStoreClient, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    fn list_containers(&self) -> RemoteStream<'_, ContainerProperties> {
        self.client
            .containers(self.page_size)
            .map_err(RemoteError::from)
            .boxed()
    }

    fn list_blobs<'a>(&'a self, container: &'a str) -> RemoteStream<'a, BlobProperties> {
        self.client
            .blobs(container, self.page_size)
            .map_err(RemoteError::from)
            .boxed()
    }
}
