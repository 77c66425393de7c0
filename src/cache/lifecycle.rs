//! Install and activation.
//!
//! `Idle -> Installing -> Installed -> Activating -> Active`. Install
//! pre-populates the static partition and seeds the offline placeholder;
//! activation removes partitions of earlier versions and resets telemetry.
//! Activation may also run straight from `Idle` when the store was populated
//! by an earlier process.

use std::fmt;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use futures::{StreamExt, stream};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

use super::config::CacheConfig;
use super::keys::{PartitionKind, RequestKey};
use super::lock::{read_or_recover, write_or_recover};
use super::network::Network;
use super::request::{FetchRequest, FetchResponse};
use super::store::{CacheStorage, StoreError, StoredResponse, should_store_response};
use super::telemetry::TelemetryAggregator;

const INSTALL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Installing,
    Installed,
    Activating,
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: LifecycleState,
    },
    #[error("invalid resource path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What install managed to cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub skipped: Vec<String>,
}

/// What activation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<String>,
}

pub struct LifecycleManager {
    state: RwLock<LifecycleState>,
    storage: CacheStorage,
    network: Arc<dyn Network>,
    telemetry: Arc<TelemetryAggregator>,
    config: CacheConfig,
    origin: Url,
}

impl LifecycleManager {
    pub fn new(
        config: CacheConfig,
        origin: Url,
        storage: CacheStorage,
        network: Arc<dyn Network>,
        telemetry: Arc<TelemetryAggregator>,
    ) -> Self {
        Self {
            state: RwLock::new(LifecycleState::Idle),
            storage,
            network,
            telemetry,
            config,
            origin,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *read_or_recover(&self.state, "cache::lifecycle::state")
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: &[LifecycleState],
        next: LifecycleState,
    ) -> Result<LifecycleState, LifecycleError> {
        let mut state = write_or_recover(&self.state, "cache::lifecycle::transition");
        if !allowed.contains(&*state) {
            return Err(LifecycleError::InvalidTransition {
                action,
                state: *state,
            });
        }
        let previous = *state;
        *state = next;
        Ok(previous)
    }

    fn set_state(&self, next: LifecycleState) {
        *write_or_recover(&self.state, "cache::lifecycle::set_state") = next;
    }

    fn resolve(&self, path: &str) -> Result<Url, LifecycleError> {
        self.origin
            .join(path)
            .map_err(|err| LifecycleError::InvalidPath {
                path: path.to_string(),
                reason: err.to_string(),
            })
    }

    /// Open partitions, cache critical resources, seed the placeholder.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
        let previous = self.transition("install", &[LifecycleState::Idle], LifecycleState::Installing)?;

        match self.run_install().await {
            Ok(report) => {
                self.set_state(LifecycleState::Installed);
                info!(
                    cached = report.cached.len(),
                    skipped = report.skipped.len(),
                    "Install complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_state(previous);
                Err(err)
            }
        }
    }

    async fn run_install(&self) -> Result<InstallReport, LifecycleError> {
        self.storage.open_all().await?;

        let requests = self
            .config
            .critical_resources
            .iter()
            .map(|path| Ok((path.clone(), FetchRequest::get(self.resolve(path)?))))
            .collect::<Result<Vec<_>, LifecycleError>>()?;

        // `buffered` keeps results in manifest order.
        let outcomes: Vec<(String, bool)> = stream::iter(requests)
            .map(|(path, request)| async move {
                let cached = self.precache(&path, &request).await;
                (path, cached)
            })
            .buffered(INSTALL_CONCURRENCY)
            .collect()
            .await;

        let mut report = InstallReport::default();
        for (path, cached) in outcomes {
            if cached {
                report.cached.push(path);
            } else {
                report.skipped.push(path);
            }
        }

        self.seed_offline_placeholder().await?;
        Ok(report)
    }

    async fn precache(&self, path: &str, request: &FetchRequest) -> bool {
        match self.network.fetch(request).await {
            Ok(response) if should_store_response(&response) => {
                let stored = StoredResponse::from_response(&response);
                self.storage
                    .put(PartitionKind::Static, &request.key(), stored)
                    .await
            }
            Ok(response) => {
                warn!(path = %path, status = %response.status, "Critical resource not cacheable");
                false
            }
            Err(err) => {
                warn!(path = %path, error = %err, "Critical resource unavailable during install");
                false
            }
        }
    }

    async fn seed_offline_placeholder(&self) -> Result<(), LifecycleError> {
        let url = self.resolve(&self.config.offline_placeholder_path)?;
        let body = json!({
            "offline": true,
            "message": "This content is not available offline yet.",
            "version": self.config.version,
        });
        let response = FetchResponse::new(StatusCode::OK, body.to_string())
            .with_header("content-type", "application/json");
        self.storage
            .put(
                PartitionKind::Api,
                &RequestKey::get(&url),
                StoredResponse::from_response(&response),
            )
            .await;
        Ok(())
    }

    /// Delete stale partitions, reset counters, start accepting requests.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn activate(&self) -> Result<ActivationReport, LifecycleError> {
        let previous = self.transition(
            "activate",
            &[LifecycleState::Idle, LifecycleState::Installed],
            LifecycleState::Activating,
        )?;

        let deleted = match self.storage.delete_stale().await {
            Ok(deleted) => deleted,
            Err(err) => {
                self.set_state(previous);
                return Err(err.into());
            }
        };

        for name in &deleted {
            info!(partition = %name, "Deleted stale partition");
        }

        self.telemetry.reset();
        self.set_state(LifecycleState::Active);
        info!(deleted = deleted.len(), "Activation complete");
        Ok(ActivationReport { deleted })
    }
}
