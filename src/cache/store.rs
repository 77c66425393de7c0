//! Partition storage.
//!
//! `StoreBackend` is the persistence seam (memory or disk); `CacheStorage`
//! is the manager the executors talk to. Reads never fail from the caller's
//! point of view: a backend error is logged and treated as a miss. Writes are
//! best-effort and replace whole entries.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::keys::{PartitionKind, PartitionNames, RequestKey};
use super::request::{CACHE_DATE_HEADER, CACHE_STATUS_HEADER, FetchResponse};

/// Immutable snapshot of a prior network response.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: OffsetDateTime,
}

impl StoredResponse {
    /// Snapshot a response as of now.
    pub fn from_response(response: &FetchResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body: response.body.clone(),
            cached_at: OffsetDateTime::now_utc(),
        }
    }

    /// Rebuild the response exactly as stored.
    pub fn into_response(self) -> FetchResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        FetchResponse {
            status,
            headers,
            body: self.body,
        }
    }

    /// Rebuild the response with the `cache-status` and `cache-date`
    /// annotations a cache hit carries.
    pub fn into_hit_response(self) -> FetchResponse {
        let cached_at = self
            .cached_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.cached_at.unix_timestamp().to_string());
        self.into_response()
            .with_header(CACHE_STATUS_HEADER, "HIT")
            .with_header(CACHE_DATE_HEADER, &cached_at)
    }
}

/// Whether a network response may be written to a partition.
pub fn should_store_response(response: &FetchResponse) -> bool {
    if !response.status.is_success() {
        return false;
    }

    if response.headers.contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    !response
        .headers
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("no-store"))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt entry in `{partition}`: {message}")]
    Corrupt { partition: String, message: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence seam for named partitions.
///
/// Implementations must make `put` replace an entry whole so concurrent
/// writers resolve as last-write-wins.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Create the partition if absent. Idempotent.
    async fn open(&self, partition: &str) -> Result<(), StoreError>;

    /// Existing partition names in creation order.
    async fn partitions(&self) -> Result<Vec<String>, StoreError>;

    /// Look up an entry. A missing partition is a miss.
    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError>;

    /// Store an entry, creating the partition on first use.
    async fn put(
        &self,
        partition: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError>;

    /// Drop a partition and all its entries. Returns false when absent.
    async fn delete(&self, partition: &str) -> Result<bool, StoreError>;

    /// Number of entries in a partition.
    async fn len(&self, partition: &str) -> Result<usize, StoreError>;
}

/// Partition listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    /// Which partition this is for the active version; absent when stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<PartitionKind>,
    pub entries: usize,
    pub stale: bool,
}

/// The cache store manager shared by every executor.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn StoreBackend>,
    names: PartitionNames,
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn StoreBackend>, names: PartitionNames) -> Self {
        Self { backend, names }
    }

    pub fn names(&self) -> &PartitionNames {
        &self.names
    }

    /// Create every partition of the active version.
    pub async fn open_all(&self) -> Result<(), StoreError> {
        for name in self.names.all() {
            self.backend.open(&name).await?;
        }
        Ok(())
    }

    /// Look up `key` in one partition of the active version.
    pub async fn get(&self, kind: PartitionKind, key: &RequestKey) -> Option<StoredResponse> {
        let partition = self.names.name(kind);
        match self.backend.get(&partition, key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    partition = %partition,
                    key = %key,
                    error = %err,
                    "Partition read failed; treating as miss"
                );
                None
            }
        }
    }

    /// Store a response in one partition of the active version.
    ///
    /// Returns false when the write failed; failures are logged only.
    pub async fn put(&self, kind: PartitionKind, key: &RequestKey, response: StoredResponse) -> bool {
        let partition = self.names.name(kind);
        match self.backend.put(&partition, key, response).await {
            Ok(()) => {
                debug!(partition = %partition, key = %key, "Stored response");
                true
            }
            Err(err) => {
                warn!(
                    partition = %partition,
                    key = %key,
                    error = %err,
                    "Partition write failed; response not cached"
                );
                false
            }
        }
    }

    /// Look up `key` in every existing partition, in creation order.
    pub async fn match_any(&self, key: &RequestKey) -> Option<StoredResponse> {
        let partitions = match self.backend.partitions().await {
            Ok(partitions) => partitions,
            Err(err) => {
                warn!(error = %err, "Listing partitions failed; treating as miss");
                return None;
            }
        };

        for partition in partitions {
            match self.backend.get(&partition, key).await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        partition = %partition,
                        key = %key,
                        error = %err,
                        "Partition read failed during global match"
                    );
                }
            }
        }
        None
    }

    /// Delete every partition whose name satisfies `predicate`.
    pub async fn delete_by_predicate<F>(&self, predicate: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&str) -> bool,
    {
        let mut deleted = Vec::new();
        for name in self.backend.partitions().await? {
            if predicate(&name) && self.backend.delete(&name).await? {
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Delete partitions left behind by earlier versions.
    pub async fn delete_stale(&self) -> Result<Vec<String>, StoreError> {
        let names = self.names.clone();
        self.delete_by_predicate(move |name| names.is_stale(name))
            .await
    }

    /// Every partition in the backend with its size.
    pub async fn summary(&self) -> Result<Vec<PartitionSummary>, StoreError> {
        let mut summary = Vec::new();
        for name in self.backend.partitions().await? {
            let entries = self.backend.len(&name).await?;
            summary.push(PartitionSummary {
                kind: self.names.kind_of(&name),
                stale: self.names.is_stale(&name),
                name,
                entries,
            });
        }
        Ok(summary)
    }
}
