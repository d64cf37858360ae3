//! The offline cache agent.
//!
//! - **install**: precache the asset list into the bucket named by the
//!   version tag, all or nothing, then skip waiting.
//! - **activate**: drop every other bucket, then claim open clients.
//! - **fetch**: navigations go network-first and refresh the shell snapshot;
//!   same-origin requests go cache-first; cross-origin requests pass through.

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use shellcache_common::AgentConfig;

use crate::cache::CacheKey;
use crate::fetch::{FetchEvent, FetchOutcome, FetchResponse, Request};
use crate::handler::{LifecycleHandler, WorkerScope};
use crate::ServiceWorkerError;

/// Stateless handler set for the offline cache agent.
#[derive(Debug, Clone, Default)]
pub struct OfflineAgent {
    config: AgentConfig,
}

impl OfflineAgent {
    /// Create an agent for `config`.
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn shell_key(&self, scope: &WorkerScope) -> Result<CacheKey, ServiceWorkerError> {
        Ok(CacheKey::get(&scope.resolve(&self.config.shell_path)?))
    }

    async fn network_first_shell(
        &self,
        scope: &WorkerScope,
        request: &Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        match scope.fetch(request).await {
            Ok(response) => {
                self.store_shell(scope, response.clone()).await;
                Ok(response)
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "Navigation failed, trying shell snapshot");
                let key = match self.shell_key(scope) {
                    Ok(key) => key,
                    Err(resolve) => {
                        warn!(error = %resolve, "Cannot resolve shell path");
                        return Err(err);
                    }
                };
                let caches = scope.caches().read().await;
                match caches.match_request(&key) {
                    Some(entry) => Ok(FetchResponse::from_cache(entry)),
                    None => {
                        warn!(url = %request.url, "No shell snapshot available");
                        Err(err)
                    }
                }
            }
        }
    }

    /// A failed write leaves the previous snapshot in place. Only an existing
    /// bucket is written, so a bucket purged by a newer version stays gone.
    async fn store_shell(&self, scope: &WorkerScope, copy: FetchResponse) {
        let key = match self.shell_key(scope) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "Cannot resolve shell path");
                return;
            }
        };

        let name = &self.config.cache_name;
        let mut caches = scope.caches().write().await;
        let Some(cache) = caches.get_mut(name) else {
            debug!(cache = %name, "Cache gone, shell snapshot dropped");
            return;
        };

        match cache.put(key.clone(), copy.into_cache_entry(&key)) {
            Ok(()) => debug!(cache = %name, "Shell snapshot refreshed"),
            Err(err) => warn!(error = %err, "Shell snapshot not stored"),
        }
    }

    async fn cache_first(
        &self,
        scope: &WorkerScope,
        request: &Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let key = request.cache_key();
        let cached = {
            let caches = scope.caches().read().await;
            caches.match_request(&key).map(FetchResponse::from_cache)
        };

        match cached {
            Some(response) => {
                debug!(url = %request.url, "Cache hit");
                Ok(response)
            }
            None => {
                debug!(url = %request.url, "Cache miss, fetching");
                scope.fetch(request).await
            }
        }
    }
}

#[async_trait]
impl LifecycleHandler for OfflineAgent {
    async fn on_install(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError> {
        scope.skip_waiting();

        let name = &self.config.cache_name;
        scope.caches().write().await.open(name);

        let requests = self
            .config
            .assets
            .iter()
            .map(|path| scope.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>, _>>()?;

        let fetches = requests.iter().map(|request| async move {
            let response = scope.fetch(request).await.map_err(|err| {
                ServiceWorkerError::InstallFailed(format!("{}: {}", request.url, err))
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "{} responded with status {}",
                    request.url, response.status
                )));
            }
            let key = request.cache_key();
            let entry = response.into_cache_entry(&key);
            Ok::<_, ServiceWorkerError>((key, entry))
        });

        let snapshots = try_join_all(fetches).await?;
        let count = snapshots.len();

        scope
            .caches()
            .write()
            .await
            .open(name)
            .put_all(snapshots)
            .map_err(|err| ServiceWorkerError::InstallFailed(err.to_string()))?;

        info!(cache = %name, assets = count, "Assets precached");
        Ok(())
    }

    async fn on_activate(&self, scope: &WorkerScope) -> Result<(), ServiceWorkerError> {
        let current = &self.config.cache_name;
        let stale: Vec<String> = scope
            .caches()
            .read()
            .await
            .keys()
            .into_iter()
            .filter(|name| *name != current.as_str())
            .map(str::to_string)
            .collect();

        for name in stale {
            // Best effort: a bucket that is already gone is not an error.
            if scope.caches().write().await.delete(&name) {
                info!(cache = %name, "Deleted stale cache");
            } else {
                debug!(cache = %name, "Stale cache already removed");
            }
        }

        scope.claim_clients();
        Ok(())
    }

    async fn on_fetch(&self, scope: &WorkerScope, event: &FetchEvent) -> FetchOutcome {
        let request = &event.request;

        if request.is_navigation() {
            return FetchOutcome::Respond(self.network_first_shell(scope, request).await);
        }

        if scope.is_same_origin(&request.url) {
            return FetchOutcome::Respond(self.cache_first(scope, request).await);
        }

        debug!(url = %request.url, "Cross-origin request, not intercepting");
        FetchOutcome::Passthrough
    }
}
