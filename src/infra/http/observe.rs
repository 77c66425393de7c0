use std::convert::Infallible;

use async_stream::stream;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::cache::{MetricsSnapshot, SyncError, SyncOutcome};

use super::{HttpError, ProxyState};

/// Stream metrics broadcasts as server-sent events.
///
/// The stream opens with a `snapshot` event carrying the current counters,
/// then forwards every broadcast under its event type.
pub(super) async fn metrics_stream(State(state): State<ProxyState>) -> Response {
    let telemetry = state.interceptor.telemetry();
    let mut observer = match telemetry.subscribe() {
        Ok(observer) => observer,
        Err(err) => {
            return HttpError::from_error(
                "infra::http::metrics_stream",
                StatusCode::TOO_MANY_REQUESTS,
                "Too many metrics observers",
                &err,
            )
            .into_response();
        }
    };
    let initial = telemetry.snapshot();
    debug!(observers = telemetry.observer_count(), "Metrics observer connected");

    let stream = stream! {
        yield Ok::<Event, Infallible>(json_event("snapshot", &initial));
        loop {
            match observer.recv().await {
                Ok(message) => {
                    let name = serde_json::to_value(message.event)
                        .ok()
                        .and_then(|value| value.as_str().map(str::to_string))
                        .unwrap_or_else(|| "message".to_string());
                    yield Ok(json_event(&name, &message));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Metrics observer lagged; messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    let event = Event::default().event(name);
    match serde_json::to_string(payload) {
        Ok(data) => event.data(data),
        Err(err) => event.comment(format!("serialization failed: {err}")),
    }
}

pub(super) async fn metrics_snapshot(State(state): State<ProxyState>) -> Json<MetricsSnapshot> {
    Json(state.interceptor.telemetry().snapshot())
}

pub(super) async fn partitions(State(state): State<ProxyState>) -> Response {
    match state.interceptor.storage().summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => HttpError::from_error(
            "infra::http::partitions",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Partitions could not be listed",
            &err,
        )
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct SyncReply<'a> {
    tag: &'a str,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_in_ms: Option<u64>,
}

pub(super) async fn trigger_sync(
    State(state): State<ProxyState>,
    Path(tag): Path<String>,
) -> Response {
    let source = "infra::http::trigger_sync";
    match state.sync.fire(&tag).await {
        Ok(SyncOutcome::Completed) => Json(SyncReply {
            tag: &tag,
            outcome: "completed",
            retry_in_ms: None,
        })
        .into_response(),
        Ok(SyncOutcome::RetryScheduled { delay }) => (
            StatusCode::ACCEPTED,
            Json(SyncReply {
                tag: &tag,
                outcome: "retry_scheduled",
                retry_in_ms: Some(delay.as_millis().min(u128::from(u64::MAX)) as u64),
            }),
        )
            .into_response(),
        Ok(SyncOutcome::RetryPending) => (
            StatusCode::ACCEPTED,
            Json(SyncReply {
                tag: &tag,
                outcome: "retry_pending",
                retry_in_ms: None,
            }),
        )
            .into_response(),
        Err(err @ SyncError::UnknownTag(_)) => {
            HttpError::from_error(source, StatusCode::NOT_FOUND, "Unknown sync tag", &err)
                .into_response()
        }
        Err(err @ SyncError::Failed(_)) => {
            HttpError::from_error(source, StatusCode::BAD_GATEWAY, "Sync failed", &err)
                .into_response()
        }
    }
}
