//! Engine configuration.
//!
//! Controls partition naming, the classifier's pattern tables, the install
//! set, and timing for the network-first path. Populated from the `[cache]`
//! and `[upstream]` sections of `fetchward.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_PREFIX: &str = "fetchward";
const DEFAULT_VERSION: &str = "v1";
const DEFAULT_SHELL_PATH: &str = "/index.html";
const DEFAULT_OFFLINE_PLACEHOLDER_PATH: &str = "/offline.json";
const DEFAULT_NETWORK_FIRST_TIMEOUT_MS: u64 = 5000;

const DEFAULT_CRITICAL_RESOURCES: &[&str] = &["/", "/index.html", "/manifest.json"];
const DEFAULT_NETWORK_FIRST_HOSTS: &[&str] = &[
    "firestore.googleapis.com",
    "identitytoolkit.googleapis.com",
    "securetoken.googleapis.com",
];
const DEFAULT_CACHE_FIRST_PATHS: &[&str] = &[
    "/static/",
    "/assets/",
    "/fonts/",
    "fonts.googleapis.com",
    "fonts.gstatic.com",
];
const DEFAULT_STALE_WHILE_REVALIDATE_PATHS: &[&str] =
    &["/api/leaderboard", "/api/achievements", "/api/profile"];
const DEFAULT_CACHE_ONLY_PATHS: &[&str] = &["/offline", "/manifest.json"];
const DEFAULT_API_PATHS: &[&str] = &["/api/", "firestore.googleapis.com"];
const DEFAULT_REALTIME_PATHS: &[&str] = &["/realtime/", "/sync/", "firebaseio.com"];

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Engine configuration from `fetchward.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix shared by every partition name this engine owns.
    pub prefix: String,
    /// Active release version embedded in partition names.
    pub version: String,
    /// Path of the application shell served to offline navigations.
    pub shell_path: String,
    /// Path of the placeholder document seeded into the API partition.
    pub offline_placeholder_path: String,
    /// Paths fetched into the static partition during install.
    pub critical_resources: Vec<String>,
    /// Hosts whose traffic always goes network-first.
    pub network_first_hosts: Vec<String>,
    /// URL fragments served cache-first.
    pub cache_first_paths: Vec<String>,
    /// URL fragments served stale-while-revalidate.
    pub stale_while_revalidate_paths: Vec<String>,
    /// URL fragments served from cache only.
    pub cache_only_paths: Vec<String>,
    /// URL fragments identifying data-API calls.
    pub api_paths: Vec<String>,
    /// URL fragments identifying real-time sync calls.
    pub realtime_paths: Vec<String>,
    /// Network budget on the network-first path (ms).
    pub network_first_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            version: DEFAULT_VERSION.to_string(),
            shell_path: DEFAULT_SHELL_PATH.to_string(),
            offline_placeholder_path: DEFAULT_OFFLINE_PLACEHOLDER_PATH.to_string(),
            critical_resources: owned(DEFAULT_CRITICAL_RESOURCES),
            network_first_hosts: owned(DEFAULT_NETWORK_FIRST_HOSTS),
            cache_first_paths: owned(DEFAULT_CACHE_FIRST_PATHS),
            stale_while_revalidate_paths: owned(DEFAULT_STALE_WHILE_REVALIDATE_PATHS),
            cache_only_paths: owned(DEFAULT_CACHE_ONLY_PATHS),
            api_paths: owned(DEFAULT_API_PATHS),
            realtime_paths: owned(DEFAULT_REALTIME_PATHS),
            network_first_timeout_ms: DEFAULT_NETWORK_FIRST_TIMEOUT_MS,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let cache = &settings.cache;
        Self {
            prefix: cache.prefix.clone(),
            version: cache.version.clone(),
            shell_path: cache.shell_path.clone(),
            offline_placeholder_path: cache.offline_placeholder_path.clone(),
            critical_resources: cache.critical_resources.clone(),
            network_first_hosts: cache.network_first_hosts.clone(),
            cache_first_paths: cache.cache_first_paths.clone(),
            stale_while_revalidate_paths: cache.stale_while_revalidate_paths.clone(),
            cache_only_paths: cache.cache_only_paths.clone(),
            api_paths: cache.api_paths.clone(),
            realtime_paths: cache.realtime_paths.clone(),
            network_first_timeout_ms: settings.upstream.network_first_timeout.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    pub fn network_first_timeout(&self) -> Duration {
        Duration::from_millis(self.network_first_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.prefix, "fetchward");
        assert_eq!(config.version, "v1");
        assert_eq!(config.shell_path, "/index.html");
        assert_eq!(config.network_first_timeout(), Duration::from_secs(5));
        assert!(config.critical_resources.contains(&"/index.html".to_string()));
        assert!(!config.api_paths.is_empty());
    }

    #[test]
    fn partial_overrides_keep_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"version":"v9","cache_only_paths":["/x"]}"#)
                .expect("valid config");
        assert_eq!(config.version, "v9");
        assert_eq!(config.cache_only_paths, vec!["/x"]);
        assert_eq!(config.prefix, "fetchward");
    }
}
