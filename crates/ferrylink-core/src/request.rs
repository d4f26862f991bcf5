//! Logical requests and transport responses.

use crate::{FerryError, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use url::{form_urlencoded, Url};

/// HTTP methods supported by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Methods that are safe to repeat without changing server state twice.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, HttpMethod::Post | HttpMethod::Patch)
    }
}

impl FromStr for HttpMethod {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(FerryError::InvalidRequest {
                message: format!("Unsupported HTTP method: {}", other),
            }),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a logical call.
///
/// Builder methods consume and return the request, so an adapted request is
/// always a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    path: String,
    method: HttpMethod,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Option<Bytes>,
    cacheable: Option<bool>,
    auth_retry: bool,
    token_generation: Option<u64>,
}

impl Request {
    pub fn new(path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            path: path.into(),
            method,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            cacheable: None,
            auth_retry: false,
            token_generation: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Get)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Post)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Put)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Patch)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Delete)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Head)
    }

    pub fn options(path: impl Into<String>) -> Self {
        Self::new(path, HttpMethod::Options)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a header, replacing any existing value under the same name
    /// (names compare case-insensitively).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if let Some(existing) = self.header_key(&name) {
            self.headers.remove(&existing);
        }
        self.headers.insert(name, value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set `Content-Type`.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(body))
    }

    /// Override whether the response may be served from and stored in the
    /// cache. By default only GET responses are cached.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cacheable = Some(enabled);
        self
    }

    pub(crate) fn into_auth_retry(mut self) -> Self {
        self.auth_retry = true;
        self
    }

    pub(crate) fn with_token_generation(mut self, generation: u64) -> Self {
        self.token_generation = Some(generation);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
            .unwrap_or(self.method == HttpMethod::Get)
    }

    /// True for the single bonus attempt made after a token refresh.
    pub fn is_auth_retry(&self) -> bool {
        self.auth_retry
    }

    /// Generation of the bearer token attached to this request, if any.
    pub fn token_generation(&self) -> Option<u64> {
        self.token_generation
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    fn header_key(&self, name: &str) -> Option<String> {
        self.headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Deterministic cache key: `METHOD:path?k=v&k2=v2` with the query pairs
    /// form-encoded and sorted, so parameter order never changes the key.
    pub fn cache_key(&self) -> String {
        let mut pairs: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", form_encode(k), form_encode(v)))
            .collect();
        pairs.sort();
        let query = pairs.join("&");
        format!("{}:{}?{}", self.method.as_str(), self.path, query)
    }

    /// Resolve the request path (and query) into an absolute URL.
    pub fn url(&self, base: Option<&Url>) -> Result<Url> {
        let mut url = match base {
            Some(base) => base.join(&self.path)?,
            None => Url::parse(&self.path)?,
        };

        if !url.has_host() {
            return Err(FerryError::InvalidRequest {
                message: format!("URL has no host: {}", url),
            });
        }

        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, v);
            }
        }

        Ok(url)
    }
}

/// A transport response: status, headers and raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decode the body as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        decode_json(&self.body)
    }

    /// Convert a non-2xx response into a `ServerStatus` error.
    pub fn into_server_error(self) -> FerryError {
        FerryError::ServerStatus {
            status: self.status,
            body: self.body,
        }
    }
}

fn form_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Decode JSON bytes into `T`, mapping failures to `Decoding`.
///
/// An empty or whitespace-only body decodes as `null`, so `()` and
/// `Option<_>` targets accept bodiless replies such as 204.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let bytes = if bytes.iter().all(u8::is_ascii_whitespace) {
        &b"null"[..]
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(FerryError::decoding)
}
