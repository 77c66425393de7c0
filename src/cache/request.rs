//! Request and response values flowing through the interceptor.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use url::Url;

use super::keys::RequestKey;

/// Header added to responses served from a partition.
pub const CACHE_STATUS_HEADER: &str = "cache-status";
/// Header carrying the time the served entry was stored.
pub const CACHE_DATE_HEADER: &str = "cache-date";
/// Header added to responses produced while the network was unreachable.
pub const OFFLINE_HEADER: &str = "x-fetchward-offline";
/// Header naming which fallback produced an offline response.
pub const FALLBACK_HEADER: &str = "x-fetchward-fallback";

const SEC_FETCH_MODE: &str = "sec-fetch-mode";
const SEC_FETCH_DEST: &str = "sec-fetch-dest";

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    #[default]
    Other,
}

/// Content hint describing what the caller will do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Script,
    Style,
    Audio,
    Image,
    #[default]
    Other,
}

impl Destination {
    fn from_sec_fetch_dest(value: &str) -> Self {
        match value {
            "document" | "iframe" => Destination::Document,
            "script" | "worker" | "sharedworker" => Destination::Script,
            "style" => Destination::Style,
            "audio" | "track" => Destination::Audio,
            "image" => Destination::Image,
            _ => Destination::Other,
        }
    }
}

/// An outbound request issued by the application.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub mode: RequestMode,
    pub destination: Destination,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            mode: RequestMode::Other,
            destination: Destination::Other,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// A top-level navigation to `url`.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .with_mode(RequestMode::Navigate)
            .with_destination(Destination::Document)
    }

    /// Build a request from raw parts, deriving mode and destination from
    /// `Sec-Fetch-*` and `Accept` headers.
    pub fn from_parts(method: Method, url: Url, headers: HeaderMap, body: Bytes) -> Self {
        let destination = headers
            .get(SEC_FETCH_DEST)
            .and_then(|value| value.to_str().ok())
            .map(Destination::from_sec_fetch_dest)
            .unwrap_or_default();

        let navigates = headers
            .get(SEC_FETCH_MODE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == "navigate")
            .unwrap_or_else(|| {
                method == Method::GET
                    && headers
                        .get(header::ACCEPT)
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| value.contains("text/html"))
            });

        Self {
            method,
            url,
            headers,
            body,
            mode: if navigates {
                RequestMode::Navigate
            } else {
                RequestMode::Other
            },
            destination,
        }
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}

/// A response handed back to the caller.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// True when the response was served from a partition.
    pub fn is_cache_hit(&self) -> bool {
        self.header(CACHE_STATUS_HEADER) == Some("HIT")
    }

    /// True when the response was produced without the network.
    pub fn is_offline(&self) -> bool {
        self.header(OFFLINE_HEADER) == Some("true")
    }

    /// Mark as produced while the network was unreachable.
    pub(crate) fn mark_offline(self, fallback: &str) -> Self {
        self.with_header(OFFLINE_HEADER, "true")
            .with_header(FALLBACK_HEADER, fallback)
    }
}
