//! # Lifecycle Tests
//!
//! The offline agent hosted in a container: registration, version upgrades,
//! client control and fetch dispatch.

mod common;

use std::sync::Arc;

use common::{init_test_logging, serve_assets, url, ScriptedNetwork, ORIGIN};
use shellcache_sw::{
    AgentConfig, CacheStorage, FetchEvent, OfflineAgent, RegistrationOptions, Request,
    ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
};

const SCOPE: &str = "https://ecole.example/";

fn root_scope() -> RegistrationOptions {
    RegistrationOptions {
        scope: Some("/".into()),
    }
}

fn agent(cache_name: &str) -> Arc<OfflineAgent> {
    Arc::new(OfflineAgent::new(
        AgentConfig::default().with_cache_name(cache_name),
    ))
}

async fn register(container: &ServiceWorkerContainer, cache_name: &str) -> ServiceWorkerId {
    init_test_logging();

    container
        .register(&format!("{}/static/sw.js", ORIGIN), root_scope(), agent(cache_name))
        .await
        .unwrap()
}

/// Install skips waiting, so the agent is active right after registration.
#[tokio::test]
async fn test_register_activates_immediately() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let (container, mut rx) = ServiceWorkerContainer::new(network);

    let id = register(&container, "proscool-v1").await;

    assert_eq!(container.active_worker(SCOPE).await, Some(id));
    assert!(container.waiting_worker(SCOPE).await.is_none());

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
            states.push(new_state);
        }
    }
    assert_eq!(
        states,
        vec![
            ServiceWorkerState::Installing,
            ServiceWorkerState::Installed,
            ServiceWorkerState::Activating,
            ServiceWorkerState::Activated,
        ]
    );
}

/// Open pages come under control without a reload.
#[tokio::test]
async fn test_activation_claims_open_clients() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let (container, mut rx) = ServiceWorkerContainer::new(network);
    let page = container
        .clients
        .write()
        .await
        .open_window(&format!("{}/eleves/", ORIGIN))
        .unwrap();

    let id = register(&container, "proscool-v1").await;

    let clients = container.clients.read().await;
    assert_eq!(clients.get(&page.id).unwrap().controller, Some(id));

    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ServiceWorkerEvent::ControllerChange { client_id, worker_id } = event {
            changes.push((client_id, worker_id));
        }
    }
    assert_eq!(changes, vec![(page.id.clone(), id)]);
}

/// A new version deletes the previous bucket on activation.
#[tokio::test]
async fn test_upgrade_leaves_only_current_cache() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let (container, _rx) = ServiceWorkerContainer::new(network);

    let v1 = register(&container, "proscool-v1").await;
    let v2 = register(&container, "proscool-v2").await;

    assert_ne!(v1, v2);
    assert_eq!(container.active_worker(SCOPE).await, Some(v2));
    assert_eq!(container.caches.read().await.keys(), vec!["proscool-v2"]);
}

/// A navigation still in flight on the old version cannot bring its bucket
/// back once the new version has activated.
#[tokio::test]
async fn test_late_navigation_from_old_version_stores_nothing() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let slow = url("/slow/");
    network.serve(&slow, "slow page");
    network.hold(&slow);
    let (container, _rx) = ServiceWorkerContainer::new(network.clone());
    register(&container, "proscool-v1").await;

    let navigation = container.fetch(FetchEvent::new(Request::navigate(slow.clone())));
    let upgrade = async {
        network.reached(&slow).await;
        register(&container, "proscool-v2").await;
        assert_eq!(container.caches.read().await.keys(), vec!["proscool-v2"]);
        network.release(&slow);
    };
    let (response, ()) = tokio::join!(navigation, upgrade);

    assert_eq!(response.unwrap().body, b"slow page");
    let caches = container.caches.read().await;
    assert_eq!(caches.keys(), vec!["proscool-v2"]);
    let shell = caches
        .match_request(&Request::get(url("/redirection/")).cache_key())
        .unwrap();
    assert_eq!(shell.body, b"asset /redirection/");
}

/// A failed upgrade never becomes current; the old version keeps serving.
#[tokio::test]
async fn test_failed_upgrade_keeps_old_version() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let (container, _rx) = ServiceWorkerContainer::new(network.clone());
    let v1 = register(&container, "proscool-v1").await;

    network.fail(&url("/static/icons/icon-192.svg"));
    let err = container
        .register(&format!("{}/static/sw.js", ORIGIN), root_scope(), agent("proscool-v2"))
        .await
        .unwrap_err();

    assert_eq!(err.category(), "install");
    assert_eq!(container.active_worker(SCOPE).await, Some(v1));
    assert!(container.waiting_worker(SCOPE).await.is_none());

    // The old bucket still answers same-origin requests without the network.
    network.reset_calls();
    let response = container
        .fetch(FetchEvent::new(Request::get(url("/static/manifest.json"))))
        .await
        .unwrap();
    assert!(response.from_cache);
    assert_eq!(network.calls(), 0);
}

/// A first install that fails leaves no registration behind.
#[tokio::test]
async fn test_failed_first_install_removes_registration() {
    let network = ScriptedNetwork::new();
    network.set_offline(true);
    let (container, _rx) = ServiceWorkerContainer::new(network);

    let result = container
        .register(&format!("{}/static/sw.js", ORIGIN), root_scope(), agent("proscool-v1"))
        .await;

    assert!(result.is_err());
    assert!(container.get_registrations().await.is_empty());
}

/// Full offline round trip through the container.
#[tokio::test]
async fn test_offline_navigation_through_container() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    network.serve(&url("/notes/"), "<h1>Notes</h1>");
    let (container, _rx) = ServiceWorkerContainer::new(network.clone());
    let page = container
        .clients
        .write()
        .await
        .open_window(&format!("{}/notes/", ORIGIN))
        .unwrap();
    register(&container, "proscool-v1").await;

    let online = container
        .fetch(FetchEvent::new(Request::navigate(url("/notes/"))).from_client(&page.id))
        .await
        .unwrap();
    assert_eq!(online.body, b"<h1>Notes</h1>");

    network.set_offline(true);
    let offline = container
        .fetch(FetchEvent::new(Request::navigate(url("/absences/"))).from_client(&page.id))
        .await
        .unwrap();
    assert!(offline.from_cache);
    assert!(offline.same_payload(&online));

    let icon = container
        .fetch(
            FetchEvent::new(Request::get(url("/static/icons/icon-192.svg"))).from_client(&page.id),
        )
        .await
        .unwrap();
    assert_eq!(icon.body, b"asset /static/icons/icon-192.svg");
}

/// Cross-origin requests are not intercepted; the host fetches them directly.
#[tokio::test]
async fn test_cross_origin_uses_default_fetch() {
    let network = ScriptedNetwork::new();
    serve_assets(&network);
    let cdn = "https://cdn.example/chart.js".parse().unwrap();
    network.serve(&cdn, "chart");
    let (container, _rx) = ServiceWorkerContainer::new(network.clone());
    let page = container
        .clients
        .write()
        .await
        .open_window(&format!("{}/", ORIGIN))
        .unwrap();
    register(&container, "proscool-v1").await;
    network.reset_calls();

    let event = FetchEvent::new(Request::get(cdn)).from_client(&page.id);
    assert!(!container.dispatch_fetch(&event).await.is_handled());

    let response = container.fetch(event).await.unwrap();
    assert_eq!(response.body, b"chart");
    assert_eq!(network.calls(), 1);
    assert_eq!(container.caches.read().await.get("proscool-v1").unwrap().len(), 4);
}

/// Buckets survive a restart through save and load.
#[tokio::test]
async fn test_persisted_caches_serve_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.json");

    let network = ScriptedNetwork::new();
    serve_assets(&network);
    {
        let (container, _rx) = ServiceWorkerContainer::new(network.clone());
        register(&container, "proscool-v1").await;
        container.persist(&path).await.unwrap();
    }

    network.set_offline(true);
    let restored = CacheStorage::load(&path).await.unwrap();
    assert_eq!(restored.keys(), vec!["proscool-v1"]);

    let (container, _rx) = ServiceWorkerContainer::with_caches(network.clone(), restored);
    let shell = container
        .caches
        .read()
        .await
        .match_request(&Request::get(url("/redirection/")).cache_key())
        .cloned()
        .unwrap();
    assert_eq!(shell.body, b"asset /redirection/");
}
