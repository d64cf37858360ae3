//! Host side of the lifecycle: registrations, worker states, clients, and
//! fetch dispatch.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::fetch::{FetchEvent, FetchOutcome, FetchResponse};
use crate::handler::{LifecycleHandler, WorkerScope};
use crate::network::Network;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value, for logs.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    handler: Arc<dyn LifecycleHandler>,
    scope: Arc<WorkerScope>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, handler: Arc<dyn LifecycleHandler>, scope: Arc<WorkerScope>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            handler,
            scope,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    fn runtime(&self) -> (ServiceWorkerId, Arc<dyn LifecycleHandler>, Arc<WorkerScope>) {
        (self.id, Arc::clone(&self.handler), Arc::clone(&self.scope))
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .finish()
    }
}

// ==================== Registration ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the script's directory.
    pub scope: Option<String>,
}

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether this registration's scope covers `url`.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing a new worker. A previous installing worker is discarded.
    pub fn update(&mut self, mut worker: ServiceWorker) {
        if let Some(mut previous) = self.installing.take() {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        worker.set_state(ServiceWorkerState::Installing);
        self.installing = Some(worker);
    }

    /// Transition installing to waiting. A previous waiting worker becomes redundant.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            if let Some(mut previous) = self.waiting.replace(worker) {
                previous.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    /// Discard the installing worker; the active one keeps serving.
    pub fn install_failed(&mut self) -> Option<ServiceWorkerId> {
        self.installing.take().map(|mut worker| {
            worker.set_state(ServiceWorkerState::Redundant);
            worker.id
        })
    }

    /// Promote the waiting worker to active in the `Activating` state.
    ///
    /// The previous active worker becomes redundant. Returns the promoted
    /// worker's ID, or `None` if nothing was waiting.
    pub fn begin_activation(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        if let Some(mut old) = self.active.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }

        self.active.as_ref().map(|w| w.id)
    }

    /// Mark the active worker `Activated` once its activate handler is done.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// Unregister (mark as inactive).
    pub fn unregister(&mut self) {
        for mut worker in [
            self.active.take(),
            self.waiting.take(),
            self.installing.take(),
        ]
        .into_iter()
        .flatten()
        {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }

    fn has_workers(&self) -> bool {
        self.installing.is_some() || self.waiting.is_some() || self.active.is_some()
    }
}

// ==================== Clients ====================

/// A window client (a page that can be controlled).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Open an uncontrolled window client.
    pub fn open_window(&mut self, url: &str) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url)?;

        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        let client = Client {
            id: id.clone(),
            url,
            controller: None,
        };

        self.clients.insert(id, client.clone());
        Ok(client)
    }

    /// Make `worker` the controller of every client under `scope`.
    ///
    /// Returns the IDs of clients whose controller changed.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }
}

// ==================== Service Worker Container ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Update found.
    UpdateFound { registration_scope: String },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Service worker container (navigator.serviceWorker) and the host that
/// drives registered workers through install, activate and fetch.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Cache storage.
    pub caches: Arc<RwLock<CacheStorage>>,

    /// Clients.
    pub clients: Arc<RwLock<Clients>>,

    network: Arc<dyn Network>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container with empty cache storage.
    pub fn new(network: Arc<dyn Network>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::with_caches(network, CacheStorage::new())
    }

    /// Create a container over existing cache storage, e.g. one restored
    /// with [`CacheStorage::load`].
    pub fn with_caches(
        network: Arc<dyn Network>,
        caches: CacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches: Arc::new(RwLock::new(caches)),
                clients: Arc::new(RwLock::new(Clients::new())),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    /// Register a worker and run its install handler.
    ///
    /// On success the worker waits, or activates immediately if it asked to
    /// skip waiting. On failure it becomes redundant, any previously active
    /// worker keeps serving, and the install error is returned.
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        if !matches!(script_url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::SecurityError(format!(
                "unsupported script scheme: {}",
                script_url.scheme()
            )));
        }

        // Determine scope
        let scope = match options.scope {
            Some(s) => script_url
                .join(&s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => script_url.join("./")?,
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is not same-origin with script {}",
                scope, script_url
            )));
        }

        let scope_str = scope.to_string();
        let worker_scope = Arc::new(WorkerScope::new(
            script_url.clone(),
            Arc::clone(&self.caches),
            Arc::clone(&self.network),
        ));
        let worker = ServiceWorker::new(script_url, handler, worker_scope);
        let (worker_id, handler, worker_scope) = worker.runtime();

        {
            let mut registrations = self.registrations.write().await;
            registrations
                .entry(scope_str.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope))
                .update(worker);
        }

        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });
        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installing);
        info!(scope = %scope_str, worker = worker_id.raw(), "Installing service worker");

        let installed = handler.on_install(&worker_scope).await;

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;

            // Unregistered or superseded while installing.
            let still_installing = registration
                .installing
                .as_ref()
                .is_some_and(|w| w.id == worker_id);
            if !still_installing {
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {} was superseded during install",
                    worker_id.raw()
                )));
            }

            if let Err(err) = installed {
                warn!(scope = %scope_str, worker = worker_id.raw(), error = %err, "Install failed");
                registration.install_failed();
                if !registration.has_workers() {
                    registrations.remove(&scope_str);
                }
                self.emit_state(&scope_str, worker_id, ServiceWorkerState::Redundant);
                return Err(err);
            }

            registration.install_complete();
        }

        self.emit_state(&scope_str, worker_id, ServiceWorkerState::Installed);
        info!(scope = %scope_str, worker = worker_id.raw(), "Service worker installed");

        if worker_scope.skip_waiting_requested() {
            self.activate(&scope_str).await?;
        }

        Ok(worker_id)
    }

    /// Activate the waiting worker of `scope` and run its activate handler.
    pub async fn activate(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let (worker_id, handler, worker_scope, scope_url) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            let previous = registration.get_active().map(|w| w.id);
            registration.begin_activation().ok_or_else(|| {
                ServiceWorkerError::StateError(format!("no waiting worker for {}", scope))
            })?;
            if let Some(previous) = previous {
                self.emit_state(scope, previous, ServiceWorkerState::Redundant);
            }

            let (id, handler, worker_scope) = registration
                .get_active()
                .map(ServiceWorker::runtime)
                .ok_or_else(|| ServiceWorkerError::StateError(scope.to_string()))?;
            (id, handler, worker_scope, registration.scope.clone())
        };

        self.emit_state(scope, worker_id, ServiceWorkerState::Activating);

        if let Err(err) = handler.on_activate(&worker_scope).await {
            // The worker takes over regardless, as browsers do.
            warn!(scope, worker = worker_id.raw(), error = %err, "Activate handler failed");
        }

        let finished = self
            .registrations
            .write()
            .await
            .get_mut(scope)
            .is_some_and(|r| r.finish_activation(worker_id));
        if !finished {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} replaced during activation",
                worker_id.raw()
            )));
        }

        self.emit_state(scope, worker_id, ServiceWorkerState::Activated);
        info!(scope, worker = worker_id.raw(), "Service worker activated");

        if worker_scope.claim_requested() {
            let claimed = self.clients.write().await.claim(&scope_url, worker_id);
            for client_id in claimed {
                debug!(client = %client_id, worker = worker_id.raw(), "Client claimed");
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id,
                });
            }
        }

        Ok(())
    }

    /// Get registration scope for a URL (longest matching scope).
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .filter(|(_, r)| r.covers(&url))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(scope, _)| scope.clone())
    }

    /// Get all registrations.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// ID of the active worker for `scope`.
    pub async fn active_worker(&self, scope: &str) -> Option<ServiceWorkerId> {
        let registrations = self.registrations.read().await;
        registrations.get(scope)?.get_active().map(|w| w.id)
    }

    /// ID of the waiting worker for `scope`.
    pub async fn waiting_worker(&self, scope: &str) -> Option<ServiceWorkerId> {
        let registrations = self.registrations.read().await;
        registrations.get(scope)?.waiting.as_ref().map(|w| w.id)
    }

    /// Pick the activated worker that should see `event`.
    ///
    /// Navigations go to the registration covering the target URL. Other
    /// requests go to the issuing client's controller, or to the covering
    /// registration when no client is attached.
    async fn worker_for(
        &self,
        event: &FetchEvent,
    ) -> Option<(Arc<dyn LifecycleHandler>, Arc<WorkerScope>)> {
        let controller = match (&event.client_id, event.request.is_navigation()) {
            (Some(client_id), false) => {
                Some(self.clients.read().await.get(client_id)?.controller?)
            }
            _ => None,
        };

        let registrations = self.registrations.read().await;
        let worker = match controller {
            Some(id) => registrations
                .values()
                .filter_map(|r| r.get_active())
                .find(|w| w.id == id),
            None => registrations
                .values()
                .filter(|r| r.covers(&event.request.url))
                .max_by_key(|r| r.scope.as_str().len())
                .and_then(|r| r.get_active()),
        }?;

        if !worker.is_active() {
            return None;
        }
        let (_, handler, scope) = worker.runtime();
        Some((handler, scope))
    }

    /// Dispatch a fetch event to the controlling worker.
    pub async fn dispatch_fetch(&self, event: &FetchEvent) -> FetchOutcome {
        match self.worker_for(event).await {
            Some((handler, scope)) => handler.on_fetch(&scope, event).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Fetch as a controlled page would: through the worker when it
    /// intercepts, straight to the network otherwise.
    pub async fn fetch(&self, event: FetchEvent) -> Result<FetchResponse, ServiceWorkerError> {
        match self.dispatch_fetch(&event).await {
            FetchOutcome::Respond(result) => result,
            FetchOutcome::Passthrough => {
                debug!(url = %event.request.url, "Default network fetch");
                self.network.fetch(&event.request).await
            }
        }
    }

    /// Unregister a service worker.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let mut registrations = self.registrations.write().await;
        if let Some(mut registration) = registrations.remove(scope) {
            registration.unregister();
            info!(scope, "Service worker unregistered");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Save the cache storage to `path`.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), ServiceWorkerError> {
        self.caches.read().await.save(path).await
    }
}
