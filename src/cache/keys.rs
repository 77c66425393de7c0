//! Cache key definitions.
//!
//! Defines `RequestKey` for stored responses and the versioned partition
//! naming used to tell current partitions from stale ones.

use std::fmt;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Identity of a stored response: method plus absolute URL.
///
/// Only GET requests are ever stored, but the method is kept in the key so a
/// persisted entry remains self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a GET of the given URL.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable hex digest of the key, used as an on-disk file name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// The four partitions that exist side by side for one release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Application shell, scripts, styles, fonts, audio.
    Static,
    /// Data-API responses.
    Api,
    /// Real-time sync responses.
    RealtimeSync,
    /// Images.
    Images,
}

impl PartitionKind {
    /// All partitions in creation order.
    pub const ALL: [PartitionKind; 4] = [
        PartitionKind::Static,
        PartitionKind::Api,
        PartitionKind::RealtimeSync,
        PartitionKind::Images,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            PartitionKind::Static => "static",
            PartitionKind::Api => "api",
            PartitionKind::RealtimeSync => "realtime",
            PartitionKind::Images => "images",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Partition names for one release version.
///
/// A name has the shape `{prefix}-{version}-{suffix}`. Any name that starts
/// with `{prefix}-` but is not one of the four names of the active version is
/// stale and may be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    prefix: String,
    version: String,
}

impl PartitionNames {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn name(&self, kind: PartitionKind) -> String {
        format!("{}-{}-{}", self.prefix, self.version, kind.suffix())
    }

    /// Active names in creation order.
    pub fn all(&self) -> Vec<String> {
        PartitionKind::ALL
            .iter()
            .map(|kind| self.name(*kind))
            .collect()
    }

    /// True for names this crate owns (carry the prefix).
    pub fn is_owned(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// True for owned names that do not belong to the active version.
    pub fn is_stale(&self, name: &str) -> bool {
        self.is_owned(name) && !PartitionKind::ALL.iter().any(|kind| self.name(*kind) == name)
    }

    /// Resolve a name back to the partition it represents for this version.
    pub fn kind_of(&self, name: &str) -> Option<PartitionKind> {
        PartitionKind::ALL
            .into_iter()
            .find(|kind| self.name(*kind) == name)
    }
}
