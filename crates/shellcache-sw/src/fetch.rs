//! Fetch event types: the request descriptor handed to the agent and the
//! response it answers with.

use std::time::{SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::{CacheEntry, CacheKey};
use crate::ServiceWorkerError;

/// Request mode, as seen by the fetch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin only; cross-origin requests fail.
    SameOrigin,
    /// Cross-origin allowed, opaque response.
    NoCors,
    /// Cross-origin allowed under CORS.
    #[default]
    Cors,
}

// ==================== Request ====================

/// An outgoing request from a controlled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request URL.
    pub url: Url,

    /// Request method, upper case.
    pub method: String,

    /// Request mode.
    pub mode: RequestMode,

    /// Request headers.
    pub headers: HeaderMap,

    /// Request body, forwarded as-is.
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            mode: RequestMode::default(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a navigation request (full page load).
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    /// Set the method.
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header. Repeated names keep every value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether this is a full-document page load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Identity this request is cached under.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

// ==================== Fetch Event ====================

/// A fetch event dispatched to the active worker.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// ID of the client that issued the request, if any.
    pub client_id: Option<String>,
}

impl FetchEvent {
    /// Create a fetch event with no originating client.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    /// Attach the originating client.
    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// How the worker answered a fetch event.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// `respondWith`: the worker supplies the response, or the error the page sees.
    Respond(Result<FetchResponse, ServiceWorkerError>),
    /// The worker declined; the host performs its default network fetch.
    Passthrough,
}

impl FetchOutcome {
    /// Whether the worker intercepted the request.
    pub fn is_handled(&self) -> bool {
        matches!(self, FetchOutcome::Respond(_))
    }
}

// ==================== Response ====================

/// A response, either live from the network or rebuilt from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers, repeated names included.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Vec<u8>,

    /// Final URL, when known.
    pub url: Option<Url>,

    /// Whether served from a cache bucket.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a network response with the canonical status text.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let status_text = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            status,
            status_text,
            headers: HeaderMap::new(),
            body: body.into(),
            url: None,
            from_cache: false,
        }
    }

    /// Add a header. Repeated names keep every value.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in received order.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Rebuild a response from a stored snapshot.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: entry.status_text.clone(),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            url: Url::parse(&entry.url).ok(),
            from_cache: true,
        }
    }

    /// Turn this response into a snapshot stored under `key`.
    pub fn into_cache_entry(self, key: &CacheKey) -> CacheEntry {
        CacheEntry {
            url: key.url.clone(),
            method: key.method.clone(),
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            body: self.body,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Whether two responses carry the same status, headers and body.
    pub fn same_payload(&self, other: &FetchResponse) -> bool {
        self.status == other.status && self.headers == other.headers && self.body == other.body
    }
}
