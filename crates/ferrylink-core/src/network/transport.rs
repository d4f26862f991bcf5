//! Transport seams and their reqwest implementation.
//!
//! The pipeline never opens sockets itself: it hands a resolved [`Request`]
//! to a [`Transport`] and gets back status, headers and body bytes. Downloads
//! use the streaming [`DownloadTransport`] instead.

use crate::config::NetworkConfig;
use crate::error::{FerryError, Result};
use crate::request::{HttpMethod, Request, Response};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Sends one fully adapted request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request, base_url: Option<&Url>) -> Result<Response>;
}

/// An opened download: response metadata plus the body as a byte stream.
pub struct DownloadStream {
    pub status: u16,
    /// Length of this response's body.
    pub content_length: Option<u64>,
    /// Full resource size, when the server reported it in `Content-Range`.
    pub total_size: Option<u64>,
    /// `ETag` or `Last-Modified`, used to validate a later resume.
    pub validator: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl DownloadStream {
    /// True when the server honored a range request.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("total_size", &self.total_size)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

/// Opens streaming GETs, optionally starting at a byte offset.
#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Open `url`. When `offset > 0` the transport asks for `bytes=offset-`,
    /// guarded by `validator` if one is known.
    async fn open(&self, url: &str, offset: u64, validator: Option<&str>)
        -> Result<DownloadStream>;
}

/// Parse the total size out of a `Content-Range: bytes a-b/total` header.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().strip_prefix("bytes")?.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    /// No overall timeout: large bodies may stream for a long time.
    download_client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Self::with_options(NetworkConfig::REQUEST_TIMEOUT, NetworkConfig::USER_AGENT)
    }

    pub fn with_options(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FerryError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let download_client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FerryError::Network {
                message: format!("Failed to create download client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            download_client,
        })
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }

    fn collect_headers(headers: &header::HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request, base_url: Option<&Url>) -> Result<Response> {
        let url = request.url(base_url)?;
        debug!("{} {}", request.method(), url);

        let mut builder = self
            .client
            .request(Self::method(request.method()), url.clone());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| FerryError::Network {
            message: format!("{} {} failed: {}", request.method(), url, e),
            cause: std::error::Error::source(&e).map(|s| s.to_string()),
        })?;

        let status = response.status().as_u16();
        let headers = Self::collect_headers(response.headers());
        let body = response.bytes().await.map_err(|e| FerryError::Network {
            message: format!("Failed to read response body from {}: {}", url, e),
            cause: None,
        })?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl DownloadTransport for ReqwestTransport {
    async fn open(
        &self,
        url: &str,
        offset: u64,
        validator: Option<&str>,
    ) -> Result<DownloadStream> {
        let url = Url::parse(url)?;
        let mut builder = self.download_client.get(url.clone());
        if offset > 0 {
            builder = builder.header(header::RANGE, format!("bytes={}-", offset));
            if let Some(validator) = validator {
                builder = builder.header(header::IF_RANGE, validator);
            }
        }

        let response = builder.send().await.map_err(|e| FerryError::Network {
            message: format!("GET {} failed: {}", url, e),
            cause: std::error::Error::source(&e).map(|s| s.to_string()),
        })?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let total_size = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let validator = headers
            .get(header::ETAG)
            .or_else(|| headers.get(header::LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();

        if !(200..300).contains(&status) {
            let body = response.bytes().await.unwrap_or_default();
            return Err(FerryError::ServerStatus { status, body });
        }

        let body = response
            .bytes_stream()
            .map_err(|e| FerryError::Network {
                message: format!("Error reading download stream: {}", e),
                cause: None,
            })
            .boxed();

        Ok(DownloadStream {
            status,
            content_length,
            total_size,
            validator,
            body,
        })
    }
}
