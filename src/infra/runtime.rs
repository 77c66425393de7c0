//! Wiring: settings in, a ready interceptor plus its background services out.

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{
        BackgroundSync, BackoffPolicy, CacheConfig, CacheStorage, DiskBackend, Interceptor,
        MemoryBackend, Network, OUTBOX_SYNC_TAG, OutboxSync, PartitionNames, StoreBackend,
        SyncOutbox, TelemetryAggregator,
    },
    config::{BackendKind, CacheSettings, Settings, SyncSettings},
};

use super::error::InfraError;

pub struct Runtime {
    pub interceptor: Arc<Interceptor>,
    pub sync: Arc<BackgroundSync>,
    pub outbox: Arc<SyncOutbox>,
    pub telemetry: Arc<TelemetryAggregator>,
}

impl Runtime {
    pub async fn build(settings: &Settings, network: Arc<dyn Network>) -> Result<Self, InfraError> {
        let backend = open_backend(&settings.cache).await?;
        let config = CacheConfig::from(settings);
        let storage = CacheStorage::new(
            backend,
            PartitionNames::new(config.prefix.clone(), config.version.clone()),
        );
        let telemetry = Arc::new(TelemetryAggregator::new(
            settings.telemetry.channel_capacity.get(),
            settings.telemetry.max_observers.get(),
        ));

        let outbox = Arc::new(SyncOutbox::with_capacity(
            settings.sync.outbox_capacity.get(),
        ));
        let sync = Arc::new(BackgroundSync::new(backoff_policy(&settings.sync)));
        sync.register(
            OUTBOX_SYNC_TAG,
            Arc::new(OutboxSync::new(outbox.clone(), network.clone())),
        );

        let mut interceptor = Interceptor::new(
            &config,
            settings.upstream.origin.clone(),
            storage,
            network,
            telemetry.clone(),
        );
        if settings.sync.defer_failed_writes {
            interceptor = interceptor.with_outbox(outbox.clone());
        }

        Ok(Self {
            interceptor: Arc::new(interceptor),
            sync,
            outbox,
            telemetry,
        })
    }
}

pub async fn open_backend(cache: &CacheSettings) -> Result<Arc<dyn StoreBackend>, InfraError> {
    match cache.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Disk => {
            let backend = DiskBackend::open_at(&cache.directory).await?;
            info!(directory = %cache.directory.display(), "Opened disk store");
            Ok(Arc::new(backend))
        }
    }
}

pub fn backoff_policy(sync: &SyncSettings) -> BackoffPolicy {
    BackoffPolicy {
        initial: sync.initial_backoff,
        max: sync.max_backoff,
        multiplier: sync.backoff_multiplier,
        max_attempts: sync.max_attempts.get(),
    }
}
