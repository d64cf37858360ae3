//! The network the agent falls through to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::fetch::{FetchResponse, Request};
use crate::ServiceWorkerError;

/// A network capable of performing a request.
///
/// A transport failure is an `Err`; any HTTP status, including 4xx and 5xx,
/// is an `Ok` response.
#[async_trait]
pub trait Network: Send + Sync {
    /// Send `request` and read the whole response.
    async fn fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError>;
}

/// HTTP network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("shellcache/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Network`] backed by a real HTTP client.
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    /// Create a new HTTP network.
    pub fn new(config: NetworkConfig) -> Result<Self, ServiceWorkerError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpNetwork initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        let mut req_builder = self
            .client
            .request(method, request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(FetchResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: body.to_vec(),
            url: Some(url),
            from_cache: false,
        })
    }
}
