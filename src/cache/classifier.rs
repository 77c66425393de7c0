//! Request classification.
//!
//! Maps a request to a `Route` (strategy + target partition) by walking an
//! ordered rule list. Content-type rules come first, then the configured
//! pattern tables; the first match wins and anything unmatched goes
//! network-first.

use std::fmt;

use axum::http::Method;
use mime_guess::mime;
use serde::Serialize;
use url::Url;

use super::config::CacheConfig;
use super::keys::PartitionKind;
use super::request::{Destination, FetchRequest};

/// The caching algorithm applied to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
    CacheFirstWithRefresh,
    StaleWhileRevalidate,
    CacheOnly,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
            Strategy::CacheFirstWithRefresh => "cache-first-with-refresh",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::CacheOnly => "cache-only",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request's traffic belongs, independent of strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    Api,
    RealtimeSync,
    Other,
}

/// Strategy plus the partition it reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub strategy: Strategy,
    pub partition: PartitionKind,
    pub traffic: Traffic,
}

#[derive(Debug, Clone)]
enum Matcher {
    ScriptOrStyle,
    Audio,
    Image,
    Host(Vec<String>),
    Fragment(Vec<String>),
}

impl Matcher {
    fn matches(&self, url: &Url, destination: Destination) -> bool {
        match self {
            Matcher::ScriptOrStyle => {
                matches!(destination, Destination::Script | Destination::Style)
                    || is_script_or_style(url)
            }
            Matcher::Audio => destination == Destination::Audio || is_audio(url),
            Matcher::Image => destination == Destination::Image || is_image(url),
            Matcher::Host(hosts) => url
                .host_str()
                .is_some_and(|host| hosts.iter().any(|pattern| host.contains(pattern.as_str()))),
            Matcher::Fragment(fragments) => contains_any(url.as_str(), fragments),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Matcher,
    strategy: Strategy,
}

/// Ordered (predicate, strategy) table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
    api_paths: Vec<String>,
    realtime_paths: Vec<String>,
}

impl Classifier {
    pub fn new(config: &CacheConfig) -> Self {
        let rules = vec![
            Rule {
                matcher: Matcher::ScriptOrStyle,
                strategy: Strategy::CacheFirstWithRefresh,
            },
            Rule {
                matcher: Matcher::Audio,
                strategy: Strategy::CacheFirst,
            },
            Rule {
                matcher: Matcher::Image,
                strategy: Strategy::CacheFirst,
            },
            Rule {
                matcher: Matcher::Host(config.network_first_hosts.clone()),
                strategy: Strategy::NetworkFirst,
            },
            Rule {
                matcher: Matcher::Fragment(config.cache_first_paths.clone()),
                strategy: Strategy::CacheFirst,
            },
            Rule {
                matcher: Matcher::Fragment(config.stale_while_revalidate_paths.clone()),
                strategy: Strategy::StaleWhileRevalidate,
            },
            Rule {
                matcher: Matcher::Fragment(config.cache_only_paths.clone()),
                strategy: Strategy::CacheOnly,
            },
        ];

        Self {
            rules,
            api_paths: config.api_paths.clone(),
            realtime_paths: config.realtime_paths.clone(),
        }
    }

    /// Route for a URL with no content hint.
    pub fn classify(&self, url: &Url) -> Route {
        self.classify_with_hint(url, Destination::Other)
    }

    /// Route for an intercepted request, honouring its destination hint.
    pub fn classify_request(&self, request: &FetchRequest) -> Route {
        self.classify_with_hint(&request.url, request.destination)
    }

    pub fn classify_with_hint(&self, url: &Url, destination: Destination) -> Route {
        let (strategy, image) = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(url, destination))
            .map(|rule| (rule.strategy, matches!(rule.matcher, Matcher::Image)))
            .unwrap_or((Strategy::NetworkFirst, false));

        let traffic = self.traffic(url);
        let partition = if image {
            PartitionKind::Images
        } else {
            match (traffic, strategy) {
                (Traffic::RealtimeSync, _) => PartitionKind::RealtimeSync,
                (Traffic::Api, _) => PartitionKind::Api,
                (Traffic::Other, Strategy::NetworkFirst | Strategy::StaleWhileRevalidate) => {
                    PartitionKind::Api
                }
                (Traffic::Other, _) => PartitionKind::Static,
            }
        };

        Route {
            strategy,
            partition,
            traffic,
        }
    }

    /// Whether the URL is a data-API or real-time sync call.
    pub fn traffic(&self, url: &Url) -> Traffic {
        let href = url.as_str();
        if contains_any(href, &self.realtime_paths) {
            Traffic::RealtimeSync
        } else if contains_any(href, &self.api_paths) {
            Traffic::Api
        } else {
            Traffic::Other
        }
    }
}

/// Only GET requests over http(s) are intercepted; everything else passes
/// through to the network untouched.
pub fn should_intercept(request: &FetchRequest) -> bool {
    request.method == Method::GET && matches!(request.url.scheme(), "http" | "https")
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| !needle.is_empty() && haystack.contains(needle.as_str()))
}

fn guess(url: &Url) -> Option<mime::Mime> {
    mime_guess::from_path(url.path()).first()
}

fn is_script_or_style(url: &Url) -> bool {
    let path = url.path();
    if path.ends_with(".js") || path.ends_with(".mjs") || path.ends_with(".css") {
        return true;
    }
    guess(url).is_some_and(|mime| {
        mime.subtype() == mime::CSS || mime.subtype() == mime::JAVASCRIPT
    })
}

fn is_audio(url: &Url) -> bool {
    let path = url.path();
    path.contains("/audio/")
        || path.ends_with(".mp3")
        || guess(url).is_some_and(|mime| mime.type_() == mime::AUDIO)
}

fn is_image(url: &Url) -> bool {
    let path = url.path();
    path.contains("/images/")
        || path.contains("/img/")
        || guess(url).is_some_and(|mime| mime.type_() == mime::IMAGE)
}
