mod client;

pub use client::{
    ApiErrorClass, BlobProperties, BlobStoreClient, BlobStoreError, ContainerProperties,
    DEFAULT_PAGE_SIZE, Page, PublicAccess,
};
