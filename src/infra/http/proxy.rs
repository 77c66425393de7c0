use axum::{
    body::Body,
    extract::{Request, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use url::Url;

use crate::cache::{EngineError, FetchRequest, FetchResponse};

use super::{HttpError, ProxyState};

const SOURCE: &str = "infra::http::proxy";

/// Forward any request outside the control prefix through the interceptor.
pub(super) async fn proxy(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Request body could not be read",
                &err,
            )
            .into_response();
        }
    };

    let url = upstream_url(&state.origin, &parts.uri);
    let request = FetchRequest::from_parts(parts.method, url, parts.headers, body);

    match state.interceptor.handle(request).await {
        Ok(response) => into_http_response(response),
        Err(err @ EngineError::Network(_)) => HttpError::from_error(
            SOURCE,
            StatusCode::BAD_GATEWAY,
            "Upstream unreachable",
            &err,
        )
        .into_response(),
        Err(err @ EngineError::Unavailable { .. }) => HttpError::from_error(
            SOURCE,
            StatusCode::GATEWAY_TIMEOUT,
            "Not available offline",
            &err,
        )
        .into_response(),
        Err(err @ EngineError::OutboxFull(_)) => HttpError::from_error(
            SOURCE,
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many deferred writes",
            &err,
        )
        .into_response(),
    }
}

/// Map an incoming URI onto the origin. Only path and query are taken from
/// the request, so the origin's scheme and authority always win.
fn upstream_url(origin: &Url, uri: &Uri) -> Url {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

pub fn into_http_response(response: FetchResponse) -> Response {
    let FetchResponse {
        status,
        headers,
        body,
    } = response;
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
