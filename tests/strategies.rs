mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use fetchward::cache::{
    CacheConfig, DiskBackend, FALLBACK_HEADER, FetchRequest, PartitionKind, RequestKey,
};
use support::{ScriptedNetwork, active_engine, active_engine_over, eventually, test_config, url};

fn get(path: &str) -> FetchRequest {
    FetchRequest::get(url(path))
}

#[tokio::test]
async fn cache_first_hit_never_touches_network() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/static/app.woff2", "font-v1");
    let engine = active_engine(network.clone(), test_config()).await;

    let first = engine.handle(get("/static/app.woff2")).await.unwrap();
    assert!(!first.is_cache_hit());

    network.set_down(true);
    let second = engine.handle(get("/static/app.woff2")).await.unwrap();
    assert!(second.is_cache_hit());
    assert!(!second.is_offline());
    assert_eq!(second.body, "font-v1");
    assert_eq!(network.calls_to("/static/app.woff2"), 1);
}

#[tokio::test]
async fn network_first_prefers_network_and_falls_back_to_cache() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/api/items", r#"{"items":[1]}"#);
    let engine = active_engine(network.clone(), test_config()).await;

    let online = engine.handle(get("/api/items")).await.unwrap();
    assert_eq!(online.body, r#"{"items":[1]}"#);
    assert!(!online.is_cache_hit());

    network.respond_ok("/api/items", r#"{"items":[1,2]}"#);
    let fresh = engine.handle(get("/api/items")).await.unwrap();
    assert_eq!(fresh.body, r#"{"items":[1,2]}"#);

    network.set_down(true);
    let offline = engine.handle(get("/api/items")).await.unwrap();
    assert_eq!(offline.status, StatusCode::OK);
    assert_eq!(offline.body, r#"{"items":[1,2]}"#);
    assert!(offline.is_cache_hit());
    assert!(offline.is_offline());
    assert_eq!(offline.header(FALLBACK_HEADER), Some("cache"));
}

#[tokio::test]
async fn network_first_deadline_serves_cache() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/api/items", "cached");
    let engine = active_engine(network.clone(), test_config()).await;
    engine.handle(get("/api/items")).await.unwrap();

    network.respond_ok("/api/items", "too late");
    network.set_delay(Some(Duration::from_secs(2)));

    let started = Instant::now();
    let response = engine.handle(get("/api/items")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(response.body, "cached");
    assert!(response.is_offline());
}

#[tokio::test]
async fn network_first_deadline_without_cache_yields_envelope() {
    let network = ScriptedNetwork::new();
    let engine = active_engine(network.clone(), test_config()).await;
    network.set_delay(Some(Duration::from_secs(2)));

    let response = engine.handle(get("/api/items")).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "OFFLINE");
    assert!(body["cachedData"].is_null());
}

#[tokio::test]
async fn stale_while_revalidate_answers_from_cache_then_updates() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/api/profile", r#"{"name":"old"}"#);
    let engine = active_engine(network.clone(), test_config()).await;

    let first = engine.handle(get("/api/profile")).await.unwrap();
    assert!(!first.is_cache_hit());

    network.respond_ok("/api/profile", r#"{"name":"new"}"#);
    network.set_delay(Some(Duration::from_millis(200)));

    let started = Instant::now();
    let stale = engine.handle(get("/api/profile")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(stale.body, r#"{"name":"old"}"#);
    assert!(stale.is_cache_hit());

    let key = RequestKey::get(&url("/api/profile"));
    let storage = engine.storage().clone();
    eventually(|| {
        let storage = storage.clone();
        let key = key.clone();
        async move {
            storage
                .get(PartitionKind::Api, &key)
                .await
                .is_some_and(|stored| stored.body == r#"{"name":"new"}"#)
        }
    })
    .await;
    assert_eq!(network.calls_to("/api/profile"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_while_revalidate_lookup_never_sees_its_own_revalidation() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(DiskBackend::open_at(dir.path()).await.unwrap());
    let network = ScriptedNetwork::new();
    let engine = active_engine_over(backend, network.clone(), test_config()).await;

    for round in 0..50 {
        let path = format!("/api/profile?round={round}");
        network.respond_ok("/api/profile", &format!("old-{round}"));
        let miss = engine.handle(get(&path)).await.unwrap();
        assert!(!miss.is_cache_hit(), "round {round}: miss reported as hit");
        assert_eq!(miss.body, format!("old-{round}"));

        network.respond_ok("/api/profile", &format!("new-{round}"));
        let hit = engine.handle(get(&path)).await.unwrap();
        assert!(hit.is_cache_hit(), "round {round}");
        assert_eq!(hit.body, format!("old-{round}"), "round {round}: fresh body served");
    }

    let snapshot = engine.telemetry().snapshot();
    assert_eq!(snapshot.total_requests, 100);
    assert_eq!(snapshot.cache_hits, 50);
}

#[tokio::test]
async fn stale_while_revalidate_miss_waits_for_network() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/api/leaderboard", "[1,2,3]");
    let engine = active_engine(network.clone(), test_config()).await;

    let response = engine.handle(get("/api/leaderboard")).await.unwrap();
    assert_eq!(response.body, "[1,2,3]");
    assert!(!response.is_cache_hit());
}

#[tokio::test]
async fn cache_first_with_refresh_replaces_entry_in_background() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/static/app.js", "console.log(1)");
    let engine = active_engine(network.clone(), test_config()).await;
    engine.handle(get("/static/app.js")).await.unwrap();

    network.respond_ok("/static/app.js", "console.log(2)");
    let hit = engine.handle(get("/static/app.js")).await.unwrap();
    assert!(hit.is_cache_hit());
    assert_eq!(hit.body, "console.log(1)");

    let key = RequestKey::get(&url("/static/app.js"));
    let storage = engine.storage().clone();
    eventually(|| {
        let storage = storage.clone();
        let key = key.clone();
        async move {
            storage
                .get(PartitionKind::Static, &key)
                .await
                .is_some_and(|stored| stored.body == "console.log(2)")
        }
    })
    .await;

    let refreshed = engine.handle(get("/static/app.js")).await.unwrap();
    assert_eq!(refreshed.body, "console.log(2)");
}

#[tokio::test]
async fn refresh_failure_keeps_cached_entry() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/static/site.css", "body{}");
    let engine = active_engine(network.clone(), test_config()).await;
    engine.handle(get("/static/site.css")).await.unwrap();

    network.set_down(true);
    let hit = engine.handle(get("/static/site.css")).await.unwrap();
    assert_eq!(hit.body, "body{}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = engine.handle(get("/static/site.css")).await.unwrap();
    assert_eq!(again.body, "body{}");
}

#[tokio::test]
async fn cache_only_serves_installed_copy() {
    let network = ScriptedNetwork::new();
    network.respond_ok("/index.html", "<shell>");
    network.respond_ok("/manifest.json", r#"{"name":"app"}"#);
    let config = CacheConfig {
        critical_resources: vec!["/index.html".into(), "/manifest.json".into()],
        ..test_config()
    };
    let engine = active_engine(network.clone(), config).await;

    let response = engine.handle(get("/manifest.json")).await.unwrap();
    assert_eq!(response.body, r#"{"name":"app"}"#);
    assert!(response.is_cache_hit());
    assert_eq!(network.calls_to("/manifest.json"), 1);
}

#[tokio::test]
async fn uncacheable_responses_are_not_stored() {
    let network = ScriptedNetwork::new();
    network.respond_with_header("/api/session", r#"{"token":"x"}"#, "set-cookie", "sid=1");
    network.respond("/api/broken", StatusCode::INTERNAL_SERVER_ERROR, "boom");
    let engine = active_engine(network.clone(), test_config()).await;

    engine.handle(get("/api/session")).await.unwrap();
    let broken = engine.handle(get("/api/broken")).await.unwrap();
    assert_eq!(broken.status, StatusCode::INTERNAL_SERVER_ERROR);

    for path in ["/api/session", "/api/broken"] {
        let key = RequestKey::get(&url(path));
        assert!(engine.storage().match_any(&key).await.is_none(), "{path}");
    }
}
