//! Strategy executors.
//!
//! Each executor turns a request into a response plus a hit/miss signal, or
//! fails with a `StrategyError` that the engine hands to the offline
//! fallback. Background work (refresh after a hit, revalidation) runs on
//! detached tasks whose failures are logged and dropped at the task boundary.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use super::classifier::{Route, Strategy};
use super::keys::PartitionKind;
use super::network::{Network, NetworkError};
use super::request::{FetchRequest, FetchResponse};
use super::store::{CacheStorage, StoredResponse, should_store_response};

/// Result of a strategy that produced a response.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub response: FetchResponse,
    /// Served from a partition.
    pub hit: bool,
    /// False when the network was tried and failed.
    pub online: bool,
}

impl Outcome {
    fn network(response: FetchResponse) -> Self {
        Self {
            response,
            hit: false,
            online: true,
        }
    }

    fn hit(stored: StoredResponse) -> Self {
        Self {
            response: stored.into_hit_response(),
            hit: true,
            online: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("{key} is not available offline")]
    NotAvailableOffline { key: String },
    #[error("revalidation task failed: {0}")]
    Task(String),
}

/// Runs the strategy a `Route` names against shared storage and network.
#[derive(Clone)]
pub struct Executors {
    storage: CacheStorage,
    network: Arc<dyn Network>,
    network_timeout: Duration,
}

impl Executors {
    pub fn new(storage: CacheStorage, network: Arc<dyn Network>, network_timeout: Duration) -> Self {
        Self {
            storage,
            network,
            network_timeout,
        }
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    #[instrument(skip_all, fields(url = %request.url, strategy = %route.strategy))]
    pub async fn run(&self, route: Route, request: &FetchRequest) -> Result<Outcome, StrategyError> {
        match route.strategy {
            Strategy::NetworkFirst => self.network_first(route.partition, request).await,
            Strategy::CacheFirst => self.cache_first(route.partition, request).await,
            Strategy::CacheFirstWithRefresh => {
                self.cache_first_with_refresh(route.partition, request).await
            }
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(route.partition, request).await
            }
            Strategy::CacheOnly => self.cache_only(request).await,
        }
    }

    /// Network with a deadline; any partition on failure.
    pub async fn network_first(
        &self,
        partition: PartitionKind,
        request: &FetchRequest,
    ) -> Result<Outcome, StrategyError> {
        let attempt = tokio::time::timeout(self.network_timeout, self.network.fetch(request)).await;
        let error = match attempt {
            Ok(Ok(response)) => {
                store_if_cacheable(&self.storage, partition, request, &response).await;
                return Ok(Outcome::network(response));
            }
            Ok(Err(err)) => err,
            Err(_) => NetworkError::Timeout(self.network_timeout),
        };

        debug!(error = %error, "Network attempt failed; searching partitions");
        match self.storage.match_any(&request.key()).await {
            Some(stored) => Ok(Outcome {
                response: stored.into_hit_response().mark_offline("cache"),
                hit: true,
                online: false,
            }),
            None => Err(error.into()),
        }
    }

    /// Partition first; network (uncached on failure) on a miss.
    pub async fn cache_first(
        &self,
        partition: PartitionKind,
        request: &FetchRequest,
    ) -> Result<Outcome, StrategyError> {
        if let Some(stored) = self.storage.get(partition, &request.key()).await {
            return Ok(Outcome::hit(stored));
        }
        self.fetch_and_store(partition, request).await
    }

    /// Cache-first, plus a detached refresh of the entry after a hit.
    pub async fn cache_first_with_refresh(
        &self,
        partition: PartitionKind,
        request: &FetchRequest,
    ) -> Result<Outcome, StrategyError> {
        let Some(stored) = self.storage.get(partition, &request.key()).await else {
            return self.fetch_and_store(partition, request).await;
        };

        let storage = self.storage.clone();
        let network = self.network.clone();
        let request = request.clone();
        tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(response) => {
                    store_if_cacheable(&storage, partition, &request, &response).await;
                }
                Err(err) => {
                    debug!(url = %request.url, error = %err, "Background refresh failed");
                }
            }
        });

        Ok(Outcome::hit(stored))
    }

    /// Cache lookup and network run concurrently; a hit answers at once.
    ///
    /// The revalidated response is written only after the lookup has
    /// finished, so a lookup never observes its own revalidation.
    pub async fn stale_while_revalidate(
        &self,
        partition: PartitionKind,
        request: &FetchRequest,
    ) -> Result<Outcome, StrategyError> {
        let (looked_up, lookup_done) = oneshot::channel::<()>();
        let storage = self.storage.clone();
        let network = self.network.clone();
        let background = request.clone();
        let revalidation = tokio::spawn(async move {
            let result = network.fetch(&background).await;
            // A dropped sender means the caller went away; store anyway.
            let _ = lookup_done.await;
            match &result {
                Ok(response) => {
                    store_if_cacheable(&storage, partition, &background, response).await;
                }
                Err(err) => {
                    debug!(url = %background.url, error = %err, "Revalidation failed");
                }
            }
            result
        });

        let cached = self.storage.get(partition, &request.key()).await;
        let _ = looked_up.send(());
        if let Some(stored) = cached {
            return Ok(Outcome::hit(stored));
        }

        match revalidation.await {
            Ok(Ok(response)) => Ok(Outcome::network(response)),
            Ok(Err(err)) => Err(err.into()),
            Err(join) => Err(StrategyError::Task(join.to_string())),
        }
    }

    /// Any partition, never the network.
    pub async fn cache_only(&self, request: &FetchRequest) -> Result<Outcome, StrategyError> {
        let key = request.key();
        match self.storage.match_any(&key).await {
            Some(stored) => Ok(Outcome::hit(stored)),
            None => Err(StrategyError::NotAvailableOffline {
                key: key.to_string(),
            }),
        }
    }

    async fn fetch_and_store(
        &self,
        partition: PartitionKind,
        request: &FetchRequest,
    ) -> Result<Outcome, StrategyError> {
        let response = self.network.fetch(request).await?;
        store_if_cacheable(&self.storage, partition, request, &response).await;
        Ok(Outcome::network(response))
    }
}

async fn store_if_cacheable(
    storage: &CacheStorage,
    partition: PartitionKind,
    request: &FetchRequest,
    response: &FetchResponse,
) {
    if should_store_response(response) {
        storage
            .put(partition, &request.key(), StoredResponse::from_response(response))
            .await;
    }
}
