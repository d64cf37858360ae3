//! # shellcache service worker
//!
//! Offline cache agent for the web application, plus the slice of the
//! service worker runtime needed to host it.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch handlers behind [`LifecycleHandler`]
//! - **Cache API**: versioned buckets of request → response snapshots
//! - **Fetch interception**: network-first app shell, cache-first same-origin assets
//! - **Clients API**: `clients.claim()` on activation
//! - **Persistence**: buckets saved to and restored from disk
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── ServiceWorker ── LifecycleHandler (OfflineAgent)
//!     │                        └── WorkerScope (caches, network, origin)
//!     │
//!     ├── CacheStorage (caches)
//!     │       └── Cache (version tag)
//!     │               └── CacheKey → CacheEntry
//!     │
//!     └── Clients
//! ```

use thiserror::Error;

pub mod agent;
pub mod cache;
pub mod container;
pub mod fetch;
pub mod handler;
pub mod network;

pub use agent::OfflineAgent;
pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage};
pub use container::{
    Client, Clients, RegistrationOptions, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use fetch::{FetchEvent, FetchOutcome, FetchResponse, Request, RequestMode};
pub use handler::{LifecycleHandler, WorkerScope};
pub use network::{HttpNetwork, Network, NetworkConfig};
pub use shellcache_common::AgentConfig;

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceWorkerError {
    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::RegistrationFailed(_) => "registration",
            ServiceWorkerError::InstallFailed(_) => "install",
            ServiceWorkerError::SecurityError(_) => "security",
            ServiceWorkerError::NetworkError(_) => "network",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::CacheError(_) => "cache",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::Storage(_) => "storage",
        }
    }
}

impl From<url::ParseError> for ServiceWorkerError {
    fn from(err: url::ParseError) -> Self {
        ServiceWorkerError::NetworkError(format!("invalid URL: {}", err))
    }
}
