//! Telemetry aggregation and observer broadcast.
//!
//! The aggregator owns the running counters for one version epoch. Every
//! record call pushes a `MetricsMessage` onto a bounded broadcast channel;
//! publishing never blocks and is a no-op when nobody is listening.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::classifier::Strategy;
use super::lock::lock_or_recover;

pub(crate) const METRIC_REQUESTS_TOTAL: &str = "fetchward_requests_total";
pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "fetchward_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "fetchward_cache_miss_total";
pub(crate) const METRIC_OFFLINE_SERVED_TOTAL: &str = "fetchward_offline_served_total";
pub(crate) const METRIC_ERRORS_TOTAL: &str = "fetchward_errors_total";
pub(crate) const METRIC_REQUEST_MS: &str = "fetchward_request_ms";

const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_MAX_OBSERVERS: usize = 16;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    /// Hits as a rounded percentage of all requests.
    pub hit_rate: u64,
    pub offline_count: u64,
    pub error_count: u64,
    pub average_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Error,
    Periodic,
}

/// One broadcast to observers.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsMessage {
    pub id: Uuid,
    pub event: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
    pub metrics: MetricsSnapshot,
}

impl MetricsMessage {
    fn new(event: EventType, metrics: MetricsSnapshot) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            event,
            url: None,
            strategy: None,
            duration_ms: None,
            hit: None,
            online: None,
            message: None,
            timestamp: now
                .format(&Rfc3339)
                .unwrap_or_else(|_| now.unix_timestamp().to_string()),
            metrics,
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("observer limit of {0} reached")]
    TooManyObservers(usize),
}

/// A connected consumer of metrics broadcasts.
pub type Observer = broadcast::Receiver<MetricsMessage>;

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    offline: AtomicU64,
    errors: AtomicU64,
    timed: AtomicU64,
    latency_ms: AtomicU64,
}

/// Running request counters plus the observer channel.
pub struct TelemetryAggregator {
    counters: Counters,
    sender: broadcast::Sender<MetricsMessage>,
    max_observers: usize,
    admission: Mutex<()>,
}

impl TelemetryAggregator {
    pub fn new(channel_capacity: usize, max_observers: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            counters: Counters::default(),
            sender,
            max_observers: max_observers.max(1),
            admission: Mutex::new(()),
        }
    }

    /// Record a request that produced a response.
    pub fn record_request(
        &self,
        url: &str,
        strategy: Strategy,
        duration: Duration,
        hit: bool,
        online: bool,
    ) {
        let duration_ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
        let c = &self.counters;
        c.requests.fetch_add(1, Ordering::Relaxed);
        c.timed.fetch_add(1, Ordering::Relaxed);
        c.latency_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if hit {
            c.hits.fetch_add(1, Ordering::Relaxed);
        }
        if !online {
            c.offline.fetch_add(1, Ordering::Relaxed);
        }

        counter!(METRIC_REQUESTS_TOTAL, "strategy" => strategy.as_str()).increment(1);
        if hit {
            counter!(METRIC_CACHE_HIT_TOTAL, "strategy" => strategy.as_str()).increment(1);
        } else {
            counter!(METRIC_CACHE_MISS_TOTAL, "strategy" => strategy.as_str()).increment(1);
        }
        if !online {
            counter!(METRIC_OFFLINE_SERVED_TOTAL).increment(1);
        }
        histogram!(METRIC_REQUEST_MS, "strategy" => strategy.as_str()).record(duration_ms as f64);

        let mut message = MetricsMessage::new(EventType::Request, self.snapshot());
        message.url = Some(url.to_string());
        message.strategy = Some(strategy);
        message.duration_ms = Some(duration_ms);
        message.hit = Some(hit);
        message.online = Some(online);
        self.publish(message);
    }

    /// Record a request that ended in a terminal error.
    pub fn record_error(&self, url: &str, strategy: Strategy, error: &str, online: bool) {
        let c = &self.counters;
        c.requests.fetch_add(1, Ordering::Relaxed);
        c.errors.fetch_add(1, Ordering::Relaxed);

        counter!(METRIC_REQUESTS_TOTAL, "strategy" => strategy.as_str()).increment(1);
        counter!(METRIC_ERRORS_TOTAL, "strategy" => strategy.as_str()).increment(1);

        let mut message = MetricsMessage::new(EventType::Error, self.snapshot());
        message.url = Some(url.to_string());
        message.strategy = Some(strategy);
        message.online = Some(online);
        message.message = Some(error.to_string());
        self.publish(message);
    }

    /// Current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let total_requests = c.requests.load(Ordering::Relaxed);
        let cache_hits = c.hits.load(Ordering::Relaxed);
        let timed = c.timed.load(Ordering::Relaxed);
        let latency = c.latency_ms.load(Ordering::Relaxed);

        let hit_rate = if total_requests == 0 {
            0
        } else {
            (cache_hits as f64 / total_requests as f64 * 100.0).round() as u64
        };
        let average_latency_ms = if timed == 0 {
            0
        } else {
            (latency as f64 / timed as f64).round() as u64
        };

        MetricsSnapshot {
            total_requests,
            cache_hits,
            hit_rate,
            offline_count: c.offline.load(Ordering::Relaxed),
            error_count: c.errors.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }

    /// Zero every counter; called when a new version activates.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.requests,
            &c.hits,
            &c.offline,
            &c.errors,
            &c.timed,
            &c.latency_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        info!("Telemetry counters reset");
    }

    /// Register a new observer, refusing once the limit is reached.
    pub fn subscribe(&self) -> Result<Observer, TelemetryError> {
        // Count and subscribe together so concurrent callers cannot overshoot.
        let _admission = lock_or_recover(&self.admission, "cache::telemetry::subscribe");
        if self.sender.receiver_count() >= self.max_observers {
            return Err(TelemetryError::TooManyObservers(self.max_observers));
        }
        Ok(self.sender.subscribe())
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Broadcast the counters without a request event.
    pub fn publish_periodic(&self) {
        self.publish(MetricsMessage::new(EventType::Periodic, self.snapshot()));
    }

    fn publish(&self, message: MetricsMessage) {
        // Zero observers is the normal idle state.
        if let Ok(delivered) = self.sender.send(message) {
            debug!(observers = delivered, "Metrics broadcast");
        }
    }

    /// Broadcast the counters every `every` until the handle is aborted.
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                aggregator.publish_periodic();
            }
        })
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_OBSERVERS)
    }
}
