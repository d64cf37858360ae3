//! Shared fixtures for the agent tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, HeaderValue};
use shellcache_common::{init_logging, LogConfig};
use shellcache_sw::{
    CacheStorage, FetchResponse, Network, Request, ServiceWorkerError, WorkerScope,
};
use tokio::sync::{Notify, RwLock, Semaphore};
use url::Url;

pub const ORIGIN: &str = "https://ecole.example";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Route agent logs through the test harness. Later calls are no-ops.
pub fn init_test_logging() {
    let _ = init_logging(LogConfig::for_tests().with_filter("shellcache_sw=debug"));
}

/// Holds requests for one URL until released.
struct Gate {
    open: Semaphore,
    reached: Notify,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Semaphore::new(0),
            reached: Notify::new(),
        }
    }
}

/// In-memory network with scripted responses, an offline switch, held
/// requests and a call counter.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, FetchResponse>>,
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    requests: Mutex<Vec<Request>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` with status 200 at `url`.
    pub fn serve(&self, url: &Url, body: &str) {
        let response = FetchResponse::new(200, body)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        self.respond(url, response);
    }

    pub fn respond(&self, url: &Url, response: FetchResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), response.with_url(url.clone()));
    }

    /// Make requests for `url` fail at the transport level.
    pub fn fail(&self, url: &Url) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// Park requests for `url` until [`ScriptedNetwork::release`].
    pub fn hold(&self, url: &Url) {
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::new(Gate::new()));
    }

    /// Wait until a request for a held `url` is parked.
    pub async fn reached(&self, url: &Url) {
        let gate = self.gate(url).expect("url is not held");
        gate.reached.notified().await;
    }

    /// Let one parked request for `url` through.
    pub fn release(&self, url: &Url) {
        if let Some(gate) = self.gate(url) {
            gate.open.add_permits(1);
        }
    }

    fn gate(&self, url: &Url) -> Option<Arc<Gate>> {
        self.gates.lock().unwrap().get(url.as_str()).cloned()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// The most recent request that reached the network.
    pub fn last_request(&self) -> Option<Request> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(gate) = self.gate(&request.url) {
            gate.reached.notify_one();
            let _permit = gate.open.acquire().await.unwrap();
        }

        let key = request.url.to_string();
        if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
            return Err(ServiceWorkerError::NetworkError(format!(
                "{}: connection refused",
                key
            )));
        }

        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FetchResponse::new(404, "not found")))
    }
}

/// Serve every default asset.
pub fn serve_assets(network: &ScriptedNetwork) {
    for path in shellcache_common::DEFAULT_ASSETS {
        network.serve(&url(path), &format!("asset {}", path));
    }
}

pub fn scope(network: Arc<ScriptedNetwork>) -> WorkerScope {
    init_test_logging();
    WorkerScope::new(
        url("/sw.js"),
        Arc::new(RwLock::new(CacheStorage::new())),
        network,
    )
}

/// A scope whose storage already holds an empty `cache_name` bucket, as
/// after an install with no assets.
pub async fn scope_with_bucket(network: Arc<ScriptedNetwork>, cache_name: &str) -> WorkerScope {
    let scope = scope(network);
    scope.caches().write().await.open(cache_name);
    scope
}
