//! The lifecycle contract between a worker script and its host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use url::Url;

use crate::cache::CacheStorage;
use crate::fetch::{FetchEvent, FetchOutcome, FetchResponse, Request};
use crate::network::Network;
use crate::ServiceWorkerError;

/// Handlers a worker registers for its three lifecycle events.
///
/// Registered once when the worker is created; the host never swaps them.
/// Each method runs to completion before the host moves the worker on, which
/// is what `event.waitUntil(...)` expresses in a script.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Runs once per worker version. An error makes the version redundant.
    async fn on_install(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError>;

    /// Runs when the version takes over from its predecessor.
    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError>;

    /// Runs for every request from a controlled page.
    async fn on_fetch(&self, scope: &WorkerScope, event: &FetchEvent) -> FetchOutcome;
}

/// What a running worker can reach: its location, the shared caches, the
/// network, and the two lifecycle shortcuts.
pub struct WorkerScope {
    location: Url,
    caches: Arc<RwLock<CacheStorage>>,
    network: Arc<dyn Network>,
    skip_waiting: AtomicBool,
    claim_clients: AtomicBool,
}

impl WorkerScope {
    /// Create the scope for a worker loaded from `location`.
    pub fn new(location: Url, caches: Arc<RwLock<CacheStorage>>, network: Arc<dyn Network>) -> Self {
        Self {
            location,
            caches,
            network,
            skip_waiting: AtomicBool::new(false),
            claim_clients: AtomicBool::new(false),
        }
    }

    /// URL of the worker script.
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// Whether `url` shares the worker's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.location.origin()
    }

    /// Resolve a path against the worker's location.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        Ok(self.location.join(path)?)
    }

    /// The process-wide cache storage.
    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.caches
    }

    /// Perform a network fetch.
    pub async fn fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        self.network.fetch(request).await
    }

    /// Ask to activate as soon as install completes.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    /// Whether `skip_waiting` was called.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Ask to take control of every in-scope client once activated.
    pub fn claim_clients(&self) {
        self.claim_clients.store(true, Ordering::SeqCst);
    }

    /// Whether `claim_clients` was called.
    pub fn claim_requested(&self) -> bool {
        self.claim_clients.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScope")
            .field("location", &self.location.as_str())
            .field("skip_waiting", &self.skip_waiting_requested())
            .field("claim_clients", &self.claim_requested())
            .finish()
    }
}
