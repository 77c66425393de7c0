//! Background sync.
//!
//! Named triggers run a `SyncTask` when fired. A failed run re-arms the same
//! trigger on a detached task with bounded exponential backoff; after
//! `max_attempts` the trigger gives up until it is fired again. Runs of one
//! trigger never overlap: a fire that arrives mid-run waits for it.
//!
//! `SyncOutbox` + `OutboxSync` provide the one built-in task: replaying
//! write requests that were deferred while the network was down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex as RunGate;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lock::{lock_or_recover, read_or_recover, write_or_recover};
use super::network::Network;
use super::request::FetchRequest;

pub(crate) const METRIC_SYNC_ATTEMPT_TOTAL: &str = "fetchward_sync_attempt_total";

/// Tag of the built-in outbox replay trigger.
pub const OUTBOX_SYNC_TAG: &str = "outbox";

const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("no sync trigger registered as `{0}`")]
    UnknownTag(String),
    #[error("sync failed: {0}")]
    Failed(String),
}

/// The outbox refused a write because it is at capacity.
#[derive(Debug, Clone, Error)]
#[error("outbox is full ({capacity} deferred writes)")]
pub struct OutboxFull {
    pub capacity: usize,
}

/// Work a trigger performs.
#[async_trait]
pub trait SyncTask: Send + Sync {
    async fn run(&self) -> Result<(), SyncError>;
}

/// Retry delays: `initial * multiplier^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Total runs per fire, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// What firing a trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// The run failed and a retry loop was armed.
    RetryScheduled { delay: Duration },
    /// The run failed while a retry loop for this tag was already armed.
    RetryPending,
}

#[derive(Clone)]
struct Registration {
    task: Arc<dyn SyncTask>,
    gate: Arc<RunGate<()>>,
}

impl Registration {
    async fn run(&self, tag: &str, attempt: u32) -> Result<(), SyncError> {
        let _running = self.gate.lock().await;
        run_once(tag, self.task.as_ref(), attempt).await
    }
}

/// Registry of named sync triggers.
pub struct BackgroundSync {
    tasks: RwLock<HashMap<String, Registration>>,
    retrying: Arc<Mutex<HashSet<String>>>,
    policy: BackoffPolicy,
}

impl BackgroundSync {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            retrying: Arc::new(Mutex::new(HashSet::new())),
            policy,
        }
    }

    pub fn register(&self, tag: impl Into<String>, task: Arc<dyn SyncTask>) {
        let tag = tag.into();
        debug!(tag = %tag, "Sync trigger registered");
        let registration = Registration {
            task,
            gate: Arc::new(RunGate::new(())),
        };
        write_or_recover(&self.tasks, "cache::sync::register").insert(tag, registration);
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = read_or_recover(&self.tasks, "cache::sync::tags")
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    /// True while a retry loop for `tag` is armed.
    pub fn is_retrying(&self, tag: &str) -> bool {
        lock_or_recover(&self.retrying, "cache::sync::is_retrying").contains(tag)
    }

    /// Run the trigger once; arm a retry loop if it fails.
    pub async fn fire(&self, tag: &str) -> Result<SyncOutcome, SyncError> {
        let registration = read_or_recover(&self.tasks, "cache::sync::fire")
            .get(tag)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTag(tag.to_string()))?;

        let err = match registration.run(tag, 1).await {
            Ok(()) => return Ok(SyncOutcome::Completed),
            Err(err) => err,
        };

        if self.policy.max_attempts <= 1 {
            error!(tag, error = %err, "Sync failed; retries disabled");
            return Err(err);
        }

        if !lock_or_recover(&self.retrying, "cache::sync::arm").insert(tag.to_string()) {
            return Ok(SyncOutcome::RetryPending);
        }

        let delay = self.policy.delay_for(1);
        let policy = self.policy.clone();
        let retrying = Arc::clone(&self.retrying);
        let tag = tag.to_string();
        tokio::spawn(async move {
            retry_loop(&tag, registration, policy).await;
            lock_or_recover(&retrying, "cache::sync::disarm").remove(&tag);
        });

        Ok(SyncOutcome::RetryScheduled { delay })
    }
}

impl Default for BackgroundSync {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

async fn run_once(tag: &str, task: &dyn SyncTask, attempt: u32) -> Result<(), SyncError> {
    match task.run().await {
        Ok(()) => {
            counter!(METRIC_SYNC_ATTEMPT_TOTAL, "outcome" => "ok").increment(1);
            info!(tag, attempt, "Sync completed");
            Ok(())
        }
        Err(err) => {
            counter!(METRIC_SYNC_ATTEMPT_TOTAL, "outcome" => "failed").increment(1);
            warn!(tag, attempt, error = %err, "Sync attempt failed");
            Err(err)
        }
    }
}

async fn retry_loop(tag: &str, registration: Registration, policy: BackoffPolicy) {
    for attempt in 2..=policy.max_attempts {
        tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        if registration.run(tag, attempt).await.is_ok() {
            return;
        }
    }
    error!(
        tag,
        attempts = policy.max_attempts,
        "Sync gave up after exhausting retries"
    );
}

/// A write request held back until the network returns.
#[derive(Debug, Clone)]
pub struct DeferredWrite {
    pub id: Uuid,
    pub request: FetchRequest,
    pub queued_at: OffsetDateTime,
}

/// Bounded FIFO of deferred writes.
pub struct SyncOutbox {
    queue: Mutex<VecDeque<DeferredWrite>>,
    capacity: usize,
}

impl SyncOutbox {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a write; refused once `capacity` writes are waiting.
    pub fn enqueue(&self, request: FetchRequest) -> Result<Uuid, OutboxFull> {
        let mut queue = lock_or_recover(&self.queue, "cache::sync::enqueue");
        if queue.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                method = %request.method,
                url = %request.url,
                "Outbox full; write refused"
            );
            return Err(OutboxFull {
                capacity: self.capacity,
            });
        }

        let entry = DeferredWrite {
            id: Uuid::new_v4(),
            request,
            queued_at: OffsetDateTime::now_utc(),
        };
        let id = entry.id;
        info!(
            entry_id = %id,
            method = %entry.request.method,
            url = %entry.request.url,
            "Write deferred for background sync"
        );
        queue.push_back(entry);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.queue, "cache::sync::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn front(&self) -> Option<DeferredWrite> {
        lock_or_recover(&self.queue, "cache::sync::front")
            .front()
            .cloned()
    }

    fn remove(&self, id: Uuid) {
        lock_or_recover(&self.queue, "cache::sync::remove").retain(|entry| entry.id != id);
    }
}

impl Default for SyncOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Replays the outbox in order, stopping at the first failure.
pub struct OutboxSync {
    outbox: Arc<SyncOutbox>,
    network: Arc<dyn Network>,
}

impl OutboxSync {
    pub fn new(outbox: Arc<SyncOutbox>, network: Arc<dyn Network>) -> Self {
        Self { outbox, network }
    }
}

#[async_trait]
impl SyncTask for OutboxSync {
    async fn run(&self) -> Result<(), SyncError> {
        while let Some(entry) = self.outbox.front() {
            let response = self
                .network
                .fetch(&entry.request)
                .await
                .map_err(|err| SyncError::Failed(err.to_string()))?;
            if response.status.is_server_error() {
                return Err(SyncError::Failed(format!(
                    "{} {} answered {}",
                    entry.request.method, entry.request.url, response.status
                )));
            }
            debug!(entry_id = %entry.id, status = %response.status, "Deferred write delivered");
            self.outbox.remove(entry.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::http::{Method, StatusCode};
    use url::Url;

    use super::*;
    use crate::cache::network::NetworkError;
    use crate::cache::request::FetchResponse;

    /// Fails the first `failures` runs, then succeeds.
    struct Flaky {
        failures: u32,
        runs: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                runs: AtomicU32::new(0),
            })
        }

        fn runs(&self) -> u32 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SyncTask for Flaky {
        async fn run(&self) -> Result<(), SyncError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= self.failures {
                Err(SyncError::Failed(format!("run {run}")))
            } else {
                Ok(())
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            multiplier: 2.0,
            max_attempts,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let sync = BackgroundSync::default();
        assert!(matches!(
            sync.fire("nope").await,
            Err(SyncError::UnknownTag(_))
        ));
    }

    #[tokio::test]
    async fn successful_fire_completes_once() {
        let sync = BackgroundSync::new(fast_policy(3));
        let task = Flaky::new(0);
        sync.register("profile", task.clone());
        assert_eq!(sync.fire("profile").await.unwrap(), SyncOutcome::Completed);
        assert_eq!(task.runs(), 1);
        assert!(!sync.is_retrying("profile"));
    }

    #[tokio::test]
    async fn failure_rearms_until_success() {
        let sync = BackgroundSync::new(fast_policy(5));
        let task = Flaky::new(2);
        sync.register("profile", task.clone());

        let outcome = sync.fire("profile").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::RetryScheduled {
                delay: Duration::from_millis(5)
            }
        );
        wait_until(|| task.runs() == 3 && !sync.is_retrying("profile")).await;
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let sync = BackgroundSync::new(fast_policy(3));
        let task = Flaky::new(u32::MAX);
        sync.register("profile", task.clone());

        sync.fire("profile").await.unwrap();
        wait_until(|| !sync.is_retrying("profile")).await;
        assert_eq!(task.runs(), 3);
    }

    #[tokio::test]
    async fn second_fire_during_retry_does_not_stack_loops() {
        let sync = BackgroundSync::new(BackoffPolicy {
            initial: Duration::from_secs(60),
            ..fast_policy(3)
        });
        sync.register("profile", Flaky::new(u32::MAX));
        assert!(matches!(
            sync.fire("profile").await.unwrap(),
            SyncOutcome::RetryScheduled { .. }
        ));
        assert_eq!(sync.fire("profile").await.unwrap(), SyncOutcome::RetryPending);
    }

    #[derive(Default)]
    struct Recorder {
        down: bool,
        delay: Option<Duration>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Network for Recorder {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            if self.down {
                return Err(NetworkError::transport("offline"));
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            lock_or_recover(&self.seen, "test").push(request.url.path().to_string());
            Ok(FetchResponse::new(StatusCode::CREATED, ""))
        }
    }

    fn write(path: &str) -> FetchRequest {
        FetchRequest::new(
            Method::POST,
            Url::parse("https://app.test").unwrap().join(path).unwrap(),
        )
        .with_body("{}")
    }

    #[tokio::test]
    async fn outbox_replays_in_order() {
        let outbox = Arc::new(SyncOutbox::new());
        outbox.enqueue(write("/api/a")).unwrap();
        outbox.enqueue(write("/api/b")).unwrap();
        let network = Arc::new(Recorder::default());

        OutboxSync::new(outbox.clone(), network.clone())
            .run()
            .await
            .unwrap();

        assert!(outbox.is_empty());
        assert_eq!(
            *lock_or_recover(&network.seen, "test"),
            vec!["/api/a", "/api/b"]
        );
    }

    #[tokio::test]
    async fn outbox_keeps_entries_when_offline() {
        let outbox = Arc::new(SyncOutbox::new());
        outbox.enqueue(write("/api/a")).unwrap();
        let network = Arc::new(Recorder {
            down: true,
            ..Default::default()
        });

        let result = OutboxSync::new(outbox.clone(), network).run().await;
        assert!(matches!(result, Err(SyncError::Failed(_))));
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_fires_deliver_each_write_once() {
        let outbox = Arc::new(SyncOutbox::new());
        outbox.enqueue(write("/api/score")).unwrap();
        let network = Arc::new(Recorder {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let sync = BackgroundSync::new(fast_policy(3));
        sync.register(
            OUTBOX_SYNC_TAG,
            Arc::new(OutboxSync::new(outbox.clone(), network.clone())),
        );

        let (first, second) = tokio::join!(sync.fire(OUTBOX_SYNC_TAG), sync.fire(OUTBOX_SYNC_TAG));

        assert_eq!(first.unwrap(), SyncOutcome::Completed);
        assert_eq!(second.unwrap(), SyncOutcome::Completed);
        assert!(outbox.is_empty());
        assert_eq!(*lock_or_recover(&network.seen, "test"), vec!["/api/score"]);
    }

    #[test]
    fn outbox_refuses_writes_beyond_capacity() {
        let outbox = SyncOutbox::with_capacity(2);
        outbox.enqueue(write("/api/a")).unwrap();
        outbox.enqueue(write("/api/b")).unwrap();

        let err = outbox.enqueue(write("/api/c")).unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!(outbox.len(), 2);
    }
}
