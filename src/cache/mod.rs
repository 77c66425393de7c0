//! Fetchward interception engine
//!
//! Every outbound request the application issues passes through
//! [`Interceptor::handle`]:
//!
//! - **Classification**: an ordered rule table picks a [`Strategy`] and a
//!   target [`PartitionKind`] for the request.
//! - **Strategies**: network-first (with a deadline), cache-first,
//!   cache-first with background refresh, stale-while-revalidate, cache-only.
//! - **Offline fallback**: shell for navigations, a structured 503 envelope
//!   for data traffic, any cached match for the rest.
//! - **Lifecycle**: install pre-populates the static partition; activation
//!   removes partitions from earlier versions.
//! - **Background sync** and **telemetry** run beside the request path.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! prefix = "fetchward"
//! version = "v1"
//! backend = "memory"
//! # ... see config.rs for all options
//! ```

mod classifier;
mod config;
mod disk;
mod engine;
mod fallback;
mod keys;
mod lifecycle;
mod lock;
mod memory;
mod network;
mod request;
mod store;
mod strategy;
mod sync;
mod telemetry;

pub use classifier::{Classifier, Route, Strategy, Traffic, should_intercept};
pub use config::CacheConfig;
pub use disk::DiskBackend;
pub use engine::{DEFERRED_HEADER, EngineError, Interceptor};
pub use fallback::{FallbackError, OfflineEnvelope, OfflineFallback};
pub use keys::{PartitionKind, PartitionNames, RequestKey};
pub use lifecycle::{
    ActivationReport, InstallReport, LifecycleError, LifecycleManager, LifecycleState,
};
pub use memory::MemoryBackend;
pub use network::{Network, NetworkError};
pub use request::{
    CACHE_DATE_HEADER, CACHE_STATUS_HEADER, Destination, FALLBACK_HEADER, FetchRequest,
    FetchResponse, OFFLINE_HEADER, RequestMode,
};
pub use store::{
    CacheStorage, PartitionSummary, StoreBackend, StoreError, StoredResponse,
    should_store_response,
};
pub use strategy::{Executors, Outcome, StrategyError};
pub use sync::{
    BackgroundSync, BackoffPolicy, DeferredWrite, OUTBOX_SYNC_TAG, OutboxFull, OutboxSync,
    SyncError, SyncOutbox, SyncOutcome, SyncTask,
};
pub use telemetry::{
    EventType, MetricsMessage, MetricsSnapshot, Observer, TelemetryAggregator, TelemetryError,
};

pub(crate) mod metric_names {
    pub(crate) use super::sync::METRIC_SYNC_ATTEMPT_TOTAL;
    pub(crate) use super::telemetry::{
        METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_ERRORS_TOTAL,
        METRIC_OFFLINE_SERVED_TOTAL, METRIC_REQUEST_MS, METRIC_REQUESTS_TOTAL,
    };
}
