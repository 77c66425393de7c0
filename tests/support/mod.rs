#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use fetchward::cache::{
    CacheConfig, CacheStorage, FetchRequest, FetchResponse, Interceptor, MemoryBackend, Network,
    NetworkError, PartitionNames, StoreBackend, TelemetryAggregator,
};
use url::Url;

pub const ORIGIN: &str = "https://app.test";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Clone)]
struct Scripted {
    status: StatusCode,
    body: String,
    headers: Vec<(&'static str, String)>,
}

/// Network double answering from a path-keyed script.
#[derive(Default)]
pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Scripted>>,
    down: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, status: StatusCode, body: &str) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Scripted {
                status,
                body: body.to_string(),
                headers: Vec::new(),
            },
        );
    }

    pub fn respond_ok(&self, path: &str, body: &str) {
        self.respond(path, StatusCode::OK, body);
    }

    pub fn respond_with_header(&self, path: &str, body: &str, name: &'static str, value: &str) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Scripted {
                status: StatusCode::OK,
                body: body.to_string(),
                headers: vec![(name, value.to_string())],
            },
        );
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| seen.as_str() == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let path = request.url.path().to_string();
        self.calls.lock().unwrap().push(path.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(NetworkError::transport("connection refused"));
        }

        let scripted = self.routes.lock().unwrap().get(&path).cloned();
        let Some(scripted) = scripted else {
            return Ok(FetchResponse::new(StatusCode::NOT_FOUND, "not found"));
        };
        let mut response = FetchResponse::new(scripted.status, scripted.body);
        for (name, value) in &scripted.headers {
            response = response.with_header(*name, value);
        }
        Ok(response)
    }
}

pub fn test_config() -> CacheConfig {
    CacheConfig {
        critical_resources: vec!["/index.html".to_string()],
        network_first_timeout_ms: 100,
        ..Default::default()
    }
}

pub fn storage(backend: Arc<dyn StoreBackend>, config: &CacheConfig) -> CacheStorage {
    CacheStorage::new(
        backend,
        PartitionNames::new(config.prefix.clone(), config.version.clone()),
    )
}

/// An installed and activated interceptor over a memory store.
pub async fn active_engine(network: Arc<ScriptedNetwork>, config: CacheConfig) -> Interceptor {
    active_engine_over(Arc::new(MemoryBackend::new()), network, config).await
}

/// An installed and activated interceptor over `backend`.
pub async fn active_engine_over(
    backend: Arc<dyn StoreBackend>,
    network: Arc<ScriptedNetwork>,
    config: CacheConfig,
) -> Interceptor {
    let engine = Interceptor::new(
        &config,
        Url::parse(ORIGIN).unwrap(),
        storage(backend, &config),
        network,
        Arc::new(TelemetryAggregator::default()),
    );
    engine.lifecycle().install().await.unwrap();
    engine.lifecycle().activate().await.unwrap();
    engine
}

/// Poll until `check` holds, failing after roughly a second.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
