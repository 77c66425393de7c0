//! Offline fallback.
//!
//! Runs only after a strategy has failed outright. Navigations get the
//! application shell, data traffic gets a structured 503 envelope, anything
//! else gets whatever partition holds a match.

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::classifier::{Route, Traffic};
use super::keys::{PartitionKind, RequestKey};
use super::request::FetchRequest;
use super::request::FetchResponse;
use super::store::CacheStorage;

const OFFLINE_ERROR_CODE: &str = "OFFLINE";
const OFFLINE_MESSAGE: &str =
    "You are offline. The request could not reach the network; cached data is included when available.";

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("{key} is unavailable offline")]
    Unavailable { key: String },
}

/// Body of the synthetic 503 returned for data traffic.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineEnvelope {
    pub error: &'static str,
    pub message: String,
    pub offline: bool,
    pub timestamp: String,
    #[serde(rename = "cachedData")]
    pub cached_data: Value,
}

impl OfflineEnvelope {
    pub fn new(cached_data: Value) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            error: OFFLINE_ERROR_CODE,
            message: OFFLINE_MESSAGE.to_string(),
            offline: true,
            timestamp: now
                .format(&Rfc3339)
                .unwrap_or_else(|_| now.unix_timestamp().to_string()),
            cached_data,
        }
    }

    pub fn into_response(self) -> FetchResponse {
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| b"{\"error\":\"OFFLINE\"}".to_vec());
        FetchResponse::new(StatusCode::SERVICE_UNAVAILABLE, body)
            .with_header("content-type", "application/json")
            .mark_offline("envelope")
    }
}

/// Decides what to serve when a strategy produced nothing.
#[derive(Clone)]
pub struct OfflineFallback {
    storage: CacheStorage,
    shell_path: String,
}

impl OfflineFallback {
    pub fn new(storage: CacheStorage, shell_path: impl Into<String>) -> Self {
        Self {
            storage,
            shell_path: shell_path.into(),
        }
    }

    pub async fn handle(
        &self,
        request: &FetchRequest,
        route: Route,
    ) -> Result<FetchResponse, FallbackError> {
        if request.is_navigation() {
            if let Some(shell) = self.shell(request).await {
                debug!(url = %request.url, "Serving application shell offline");
                return Ok(shell);
            }
        }

        if matches!(route.traffic, Traffic::Api | Traffic::RealtimeSync) {
            let cached = self.cached_json(&request.key()).await;
            debug!(url = %request.url, has_cached = !cached.is_null(), "Serving offline envelope");
            return Ok(OfflineEnvelope::new(cached).into_response());
        }

        if let Some(stored) = self.storage.match_any(&request.key()).await {
            return Ok(stored.into_hit_response().mark_offline("cache"));
        }

        Err(FallbackError::Unavailable {
            key: request.key().to_string(),
        })
    }

    async fn shell(&self, request: &FetchRequest) -> Option<FetchResponse> {
        let shell_url = match request.url.join(&self.shell_path) {
            Ok(url) => url,
            Err(err) => {
                warn!(shell_path = %self.shell_path, error = %err, "Invalid shell path");
                return None;
            }
        };
        self.storage
            .get(PartitionKind::Static, &RequestKey::get(&shell_url))
            .await
            .map(|stored| stored.into_hit_response().mark_offline("shell"))
    }

    async fn cached_json(&self, key: &RequestKey) -> Value {
        self.storage
            .match_any(key)
            .await
            .and_then(|stored| serde_json::from_slice(&stored.body).ok())
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use url::Url;

    use super::*;
    use crate::cache::classifier::Classifier;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys::PartitionNames;
    use crate::cache::memory::MemoryBackend;
    use crate::cache::request::{FALLBACK_HEADER, FetchResponse};
    use crate::cache::store::StoredResponse;

    struct Fixture {
        storage: CacheStorage,
        fallback: OfflineFallback,
        classifier: Classifier,
    }

    fn fixture() -> Fixture {
        let storage = CacheStorage::new(
            Arc::new(MemoryBackend::new()),
            PartitionNames::new("fetchward", "v1"),
        );
        Fixture {
            fallback: OfflineFallback::new(storage.clone(), "/index.html"),
            classifier: Classifier::new(&CacheConfig::default()),
            storage,
        }
    }

    fn url(path: &str) -> Url {
        Url::parse("https://app.test").unwrap().join(path).unwrap()
    }

    fn stored(body: &'static str) -> StoredResponse {
        StoredResponse::from_response(&FetchResponse::new(StatusCode::OK, body))
    }

    fn envelope(response: &FetchResponse) -> Value {
        serde_json::from_slice(&response.body).expect("json envelope")
    }

    #[tokio::test]
    async fn navigation_gets_shell_when_cached() {
        let fx = fixture();
        fx.storage
            .put(PartitionKind::Static, &RequestKey::get(&url("/index.html")), stored("<shell>"))
            .await;

        let request = FetchRequest::navigate(url("/settings/profile"));
        let route = fx.classifier.classify_request(&request);
        let response = fx.fallback.handle(&request, route).await.unwrap();

        assert_eq!(response.body, "<shell>");
        assert!(response.is_offline());
        assert_eq!(response.header(FALLBACK_HEADER), Some("shell"));
    }

    #[tokio::test]
    async fn api_failure_gets_envelope_with_cached_payload() {
        let fx = fixture();
        let request = FetchRequest::get(url("/api/items"));
        fx.storage
            .put(PartitionKind::Api, &request.key(), stored("{\"x\":1}"))
            .await;

        let route = fx.classifier.classify_request(&request);
        let response = fx.fallback.handle(&request, route).await.unwrap();

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert!(response.is_offline());
        let body = envelope(&response);
        assert_eq!(body["error"], "OFFLINE");
        assert_eq!(body["offline"], true);
        assert!(body["message"].is_string());
        assert_eq!(body["cachedData"], serde_json::json!({"x": 1}));
        let ts = body["timestamp"].as_str().expect("timestamp string");
        assert!(OffsetDateTime::parse(ts, &Rfc3339).is_ok());
    }

    #[tokio::test]
    async fn envelope_cached_data_is_null_for_missing_or_non_json() {
        let fx = fixture();
        let request = FetchRequest::get(url("/api/items"));
        let route = fx.classifier.classify_request(&request);

        let response = fx.fallback.handle(&request, route).await.unwrap();
        assert!(envelope(&response)["cachedData"].is_null());

        fx.storage
            .put(PartitionKind::Api, &request.key(), stored("<html>not json"))
            .await;
        let response = fx.fallback.handle(&request, route).await.unwrap();
        assert!(envelope(&response)["cachedData"].is_null());
    }

    #[tokio::test]
    async fn realtime_traffic_also_gets_envelope() {
        let fx = fixture();
        let request = FetchRequest::get(url("/realtime/feed"));
        let route = fx.classifier.classify_request(&request);
        let response = fx.fallback.handle(&request, route).await.unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn navigation_without_shell_falls_through_to_partitions() {
        let fx = fixture();
        let request = FetchRequest::navigate(url("/about"));
        fx.storage
            .put(PartitionKind::Api, &request.key(), stored("about page"))
            .await;
        let route = fx.classifier.classify_request(&request);
        let response = fx.fallback.handle(&request, route).await.unwrap();
        assert_eq!(response.body, "about page");
        assert_eq!(response.header(FALLBACK_HEADER), Some("cache"));
    }

    #[tokio::test]
    async fn static_miss_everywhere_is_terminal() {
        let fx = fixture();
        let request = FetchRequest::get(url("/static/missing.woff2"));
        let route = fx.classifier.classify_request(&request);
        let err = fx.fallback.handle(&request, route).await.unwrap_err();
        assert!(matches!(err, FallbackError::Unavailable { .. }));
    }
}
