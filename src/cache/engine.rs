//! The interceptor: one entry point for every outbound request.
//!
//! Intercepted requests are classified, run through their strategy and,
//! if the strategy fails, handed to the offline fallback. Telemetry is
//! recorded exactly once per intercepted request. Everything else is passed
//! straight to the network.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::classifier::{Classifier, Route, should_intercept};
use super::config::CacheConfig;
use super::fallback::OfflineFallback;
use super::lifecycle::LifecycleManager;
use super::network::{Network, NetworkError};
use super::request::{FetchRequest, FetchResponse};
use super::store::CacheStorage;
use super::strategy::{Executors, StrategyError};
use super::sync::{OutboxFull, SyncOutbox};
use super::telemetry::TelemetryAggregator;

/// Header set on the 202 returned for a write queued in the outbox.
pub const DEFERRED_HEADER: &str = "x-fetchward-deferred";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("{key} is unavailable offline")]
    Unavailable { key: String },
    #[error(transparent)]
    OutboxFull(#[from] OutboxFull),
}

pub struct Interceptor {
    classifier: Classifier,
    executors: Executors,
    fallback: OfflineFallback,
    network: Arc<dyn Network>,
    telemetry: Arc<TelemetryAggregator>,
    lifecycle: Arc<LifecycleManager>,
    outbox: Option<Arc<SyncOutbox>>,
}

impl Interceptor {
    pub fn new(
        config: &CacheConfig,
        origin: Url,
        storage: CacheStorage,
        network: Arc<dyn Network>,
        telemetry: Arc<TelemetryAggregator>,
    ) -> Self {
        let lifecycle = LifecycleManager::new(
            config.clone(),
            origin,
            storage.clone(),
            Arc::clone(&network),
            Arc::clone(&telemetry),
        );
        Self {
            classifier: Classifier::new(config),
            executors: Executors::new(
                storage.clone(),
                Arc::clone(&network),
                config.network_first_timeout(),
            ),
            fallback: OfflineFallback::new(storage, config.shell_path.clone()),
            network,
            telemetry,
            lifecycle: Arc::new(lifecycle),
            outbox: None,
        }
    }

    /// Queue writes that fail to reach the network instead of failing them.
    pub fn with_outbox(mut self, outbox: Arc<SyncOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    pub fn storage(&self) -> &CacheStorage {
        self.executors.storage()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn handle(&self, request: FetchRequest) -> Result<FetchResponse, EngineError> {
        if !self.lifecycle.is_active() || !should_intercept(&request) {
            return self.pass_through(request).await;
        }

        let route = self.classifier.classify_request(&request);
        let started = Instant::now();
        let url = request.url.as_str();

        let error = match self.executors.run(route, &request).await {
            Ok(outcome) => {
                self.telemetry.record_request(
                    url,
                    route.strategy,
                    started.elapsed(),
                    outcome.hit,
                    outcome.online,
                );
                return Ok(outcome.response);
            }
            Err(err) => err,
        };

        warn!(strategy = %route.strategy, error = %error, "Strategy failed; trying offline fallback");
        self.recover(&request, route, started, error).await
    }

    async fn recover(
        &self,
        request: &FetchRequest,
        route: Route,
        started: Instant,
        error: StrategyError,
    ) -> Result<FetchResponse, EngineError> {
        let url = request.url.as_str();
        match self.fallback.handle(request, route).await {
            Ok(response) => {
                self.telemetry.record_request(
                    url,
                    route.strategy,
                    started.elapsed(),
                    response.is_cache_hit(),
                    false,
                );
                Ok(response)
            }
            Err(fallback) => {
                let online = !matches!(error, StrategyError::Network(_));
                self.telemetry
                    .record_error(url, route.strategy, &fallback.to_string(), online);
                match error {
                    StrategyError::Network(err) => Err(EngineError::Network(err)),
                    _ => Err(EngineError::Unavailable {
                        key: request.key().to_string(),
                    }),
                }
            }
        }
    }

    async fn pass_through(&self, request: FetchRequest) -> Result<FetchResponse, EngineError> {
        match self.network.fetch(&request).await {
            Ok(response) => Ok(response),
            Err(err) => match &self.outbox {
                Some(outbox) if is_write(&request.method) => {
                    let id = outbox.enqueue(request)?;
                    debug!(entry_id = %id, error = %err, "Network down; write deferred");
                    Ok(FetchResponse::new(StatusCode::ACCEPTED, "")
                        .with_header(DEFERRED_HEADER, "true"))
                }
                _ => Err(err.into()),
            },
        }
    }
}

fn is_write(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}
