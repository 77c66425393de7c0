//! HTTP surface: the interception proxy plus a small observation API
//! under `/__fetchward/`.

mod error;
mod middleware;
mod observe;
mod proxy;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use url::Url;

use crate::cache::{BackgroundSync, Interceptor};

pub use error::{ErrorReport, HttpError};
pub use proxy::into_http_response;

/// Path prefix reserved for the proxy's own endpoints.
pub const CONTROL_PREFIX: &str = "/__fetchward";

#[derive(Clone)]
pub struct ProxyState {
    pub interceptor: Arc<Interceptor>,
    pub sync: Arc<BackgroundSync>,
    pub origin: Url,
}

pub fn build_router(state: ProxyState) -> Router {
    let control = Router::new()
        .route("/metrics", get(observe::metrics_stream))
        .route("/metrics/snapshot", get(observe::metrics_snapshot))
        .route("/partitions", get(observe::partitions))
        .route("/sync/{tag}", post(observe::trigger_sync));

    Router::new()
        .nest(CONTROL_PREFIX, control)
        .fallback(proxy::proxy)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
