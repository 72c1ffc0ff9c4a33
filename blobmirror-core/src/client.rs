use std::collections::BTreeMap;
use std::future::Future;
use std::time::SystemTime;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

pub const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct BlobStoreClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BlobStoreClient {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, BlobStoreError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(BlobStoreError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn list_containers_page(
        &self,
        marker: Option<&str>,
        page_size: u32,
    ) -> Result<Page<ContainerProperties>, BlobStoreError> {
        let url = self.listing_url(&["v1", "containers"], marker, page_size)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_blobs_page(
        &self,
        container: &str,
        marker: Option<&str>,
        page_size: u32,
    ) -> Result<Page<BlobProperties>, BlobStoreError> {
        let url = self.listing_url(&["v1", "containers", container, "blobs"], marker, page_size)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lazily walks every container page. The next page is only requested once
    /// the consumer has drained the current one.
    pub fn containers(
        &self,
        page_size: u32,
    ) -> BoxStream<'_, Result<ContainerProperties, BlobStoreError>> {
        paginate(move |marker| async move {
            self.list_containers_page(marker.as_deref(), page_size)
                .await
        })
    }

    pub fn blobs<'a>(
        &'a self,
        container: &'a str,
        page_size: u32,
    ) -> BoxStream<'a, Result<BlobProperties, BlobStoreError>> {
        paginate(move |marker| async move {
            self.list_blobs_page(container, marker.as_deref(), page_size)
                .await
        })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn listing_url(
        &self,
        segments: &[&str],
        marker: Option<&str>,
        page_size: u32,
    ) -> Result<Url, BlobStoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BlobStoreError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxresults", &page_size.max(1).to_string());
            if let Some(marker) = marker.filter(|m| !m.is_empty()) {
                query.append_pair("marker", marker);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BlobStoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BlobStoreError::Api { status, body })
        }
    }
}

fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T, BlobStoreError>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>, BlobStoreError>> + Send + 'a,
{
    // `None` in the cursor slot means the previous page was the last one.
    stream::try_unfold((fetch, Some(None::<String>)), |(mut fetch, cursor)| async move {
        let Some(marker) = cursor else {
            return Ok::<_, BlobStoreError>(None);
        };
        let page = fetch(marker).await?;
        let next = page.next_marker.filter(|m| !m.is_empty()).map(Some);
        let items = stream::iter(page.items.into_iter().map(Ok::<T, BlobStoreError>));
        Ok(Some((items, (fetch, next))))
    })
    .try_flatten()
    .boxed()
}

impl BlobStoreError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            BlobStoreError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BlobStoreError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublicAccess {
    #[default]
    None,
    Blob,
    Container,
}

impl PublicAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicAccess::None => "none",
            PublicAccess::Blob => "blob",
            PublicAccess::Container => "container",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(PublicAccess::None),
            "blob" => Some(PublicAccess::Blob),
            "container" => Some(PublicAccess::Container),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ContainerProperties {
    pub name: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default, deserialize_with = "http_date")]
    pub last_modified: Option<SystemTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub public_access: PublicAccess,
    #[serde(default)]
    pub has_legal_hold: bool,
    #[serde(default)]
    pub has_immutability_policy: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BlobProperties {
    pub name: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default, deserialize_with = "http_date")]
    pub last_modified: Option<SystemTime>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub has_legal_hold: bool,
    #[serde(default, deserialize_with = "http_date")]
    pub retention_until: Option<SystemTime>,
}

fn http_date<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| httpdate::parse_http_date(v.trim()).map_err(serde::de::Error::custom))
        .transpose()
}
