//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fetchward";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080";
const DEFAULT_NETWORK_FIRST_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_DIRECTORY: &str = ".fetchward";
const DEFAULT_BROADCAST_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_OBSERVERS: u64 = 16;
const DEFAULT_CHANNEL_CAPACITY: u64 = 64;
const DEFAULT_SYNC_INITIAL_BACKOFF_MS: u64 = 1000;
const DEFAULT_SYNC_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_SYNC_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_SYNC_MAX_ATTEMPTS: u64 = 8;
const DEFAULT_SYNC_OUTBOX_CAPACITY: u64 = 256;

/// Command-line arguments for the fetchward binary.
#[derive(Debug, Parser)]
#[command(
    name = "fetchward",
    version,
    about = "Caching interception proxy with offline fallback"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FETCHWARD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Install, activate and serve the interception proxy.
    Serve(Box<ServeArgs>),
    /// Run a single GET through the interceptor and print the result.
    Fetch(FetchArgs),
    /// List partitions in the configured store.
    Partitions(PartitionsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Treat the request as a top-level navigation.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub navigate: bool,

    /// Absolute URL, or a path resolved against the upstream origin.
    #[arg(value_name = "URL")]
    pub url: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PartitionsArgs {
    #[command(flatten)]
    pub store: StoreOverrides,
}

/// Overrides shared by every command that opens the store.
#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the upstream origin.
    #[arg(long = "upstream-origin", value_name = "URL")]
    pub upstream_origin: Option<String>,

    /// Override the active cache version.
    #[arg(long = "cache-version", value_name = "VERSION")]
    pub cache_version: Option<String>,

    /// Override the storage backend.
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<BackendKind>,

    /// Override the on-disk store directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Queue failed writes for background sync instead of failing them.
    #[arg(
        long = "sync-defer-failed-writes",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub defer_failed_writes: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub telemetry: TelemetrySettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub origin: Url,
    pub network_first_timeout: Duration,
    pub transport_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: BackendKind,
    pub directory: PathBuf,
    pub prefix: String,
    pub version: String,
    pub shell_path: String,
    pub offline_placeholder_path: String,
    pub critical_resources: Vec<String>,
    pub network_first_hosts: Vec<String>,
    pub cache_first_paths: Vec<String>,
    pub stale_while_revalidate_paths: Vec<String>,
    pub cache_only_paths: Vec<String>,
    pub api_paths: Vec<String>,
    pub realtime_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub broadcast_interval: Duration,
    pub max_observers: NonZeroUsize,
    pub channel_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_attempts: NonZeroU32,
    pub defer_failed_writes: bool,
    pub outbox_capacity: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("FETCHWARD")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.critical_resources")
            .with_list_parse_key("cache.network_first_hosts")
            .with_list_parse_key("cache.cache_first_paths")
            .with_list_parse_key("cache.stale_while_revalidate_paths")
            .with_list_parse_key("cache.cache_only_paths")
            .with_list_parse_key("cache.api_paths")
            .with_list_parse_key("cache.realtime_paths")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Fetch(args)) => raw.apply_store_overrides(&args.store),
        Some(Command::Partitions(args)) => raw.apply_store_overrides(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    telemetry: RawTelemetrySettings,
    sync: RawSyncSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(defer) = overrides.defer_failed_writes {
            self.sync.defer_failed_writes = Some(defer);
        }

        self.apply_store_overrides(&overrides.store);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(origin) = overrides.upstream_origin.as_ref() {
            self.upstream.origin = Some(origin.clone());
        }
        if let Some(version) = overrides.cache_version.as_ref() {
            self.cache.version = Some(version.clone());
        }
        if let Some(backend) = overrides.cache_backend {
            self.cache.backend = Some(backend);
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            cache,
            telemetry,
            sync,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let cache = build_cache_settings(cache)?;
        let telemetry = build_telemetry_settings(telemetry)?;
        let sync = build_sync_settings(sync)?;

        Ok(Self {
            server,
            logging,
            upstream,
            cache,
            telemetry,
            sync,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let origin_value = upstream
        .origin
        .unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
    let origin = Url::parse(origin_value.trim())
        .map_err(|err| LoadError::invalid("upstream.origin", format!("invalid url: {err}")))?;
    if !matches!(origin.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.origin",
            "scheme must be http or https",
        ));
    }

    let network_first_ms = upstream
        .network_first_timeout_ms
        .unwrap_or(DEFAULT_NETWORK_FIRST_TIMEOUT_MS);
    if network_first_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.network_first_timeout_ms",
            "must be greater than zero",
        ));
    }

    let transport_secs = upstream
        .transport_timeout_seconds
        .unwrap_or(DEFAULT_TRANSPORT_TIMEOUT_SECS);
    if transport_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.transport_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        origin,
        network_first_timeout: Duration::from_millis(network_first_ms),
        transport_timeout: Duration::from_secs(transport_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let prefix = cache.prefix.unwrap_or(defaults.prefix);
    validate_name_segment(&prefix, "cache.prefix")?;
    let version = cache.version.unwrap_or(defaults.version);
    validate_name_segment(&version, "cache.version")?;

    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    let shell_path = cache.shell_path.unwrap_or(defaults.shell_path);
    if shell_path.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.shell_path",
            "path must not be empty",
        ));
    }
    let offline_placeholder_path = cache
        .offline_placeholder_path
        .unwrap_or(defaults.offline_placeholder_path);
    if offline_placeholder_path.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.offline_placeholder_path",
            "path must not be empty",
        ));
    }

    Ok(CacheSettings {
        backend: cache.backend.unwrap_or_default(),
        directory,
        prefix,
        version,
        shell_path,
        offline_placeholder_path,
        critical_resources: cache
            .critical_resources
            .unwrap_or(defaults.critical_resources),
        network_first_hosts: cache
            .network_first_hosts
            .unwrap_or(defaults.network_first_hosts),
        cache_first_paths: cache
            .cache_first_paths
            .unwrap_or(defaults.cache_first_paths),
        stale_while_revalidate_paths: cache
            .stale_while_revalidate_paths
            .unwrap_or(defaults.stale_while_revalidate_paths),
        cache_only_paths: cache.cache_only_paths.unwrap_or(defaults.cache_only_paths),
        api_paths: cache.api_paths.unwrap_or(defaults.api_paths),
        realtime_paths: cache.realtime_paths.unwrap_or(defaults.realtime_paths),
    })
}

fn build_telemetry_settings(
    telemetry: RawTelemetrySettings,
) -> Result<TelemetrySettings, LoadError> {
    let interval_secs = telemetry
        .broadcast_interval_seconds
        .unwrap_or(DEFAULT_BROADCAST_INTERVAL_SECS);
    if interval_secs == 0 {
        return Err(LoadError::invalid(
            "telemetry.broadcast_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(TelemetrySettings {
        broadcast_interval: Duration::from_secs(interval_secs),
        max_observers: non_zero_usize(
            telemetry.max_observers.unwrap_or(DEFAULT_MAX_OBSERVERS),
            "telemetry.max_observers",
        )?,
        channel_capacity: non_zero_usize(
            telemetry.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            "telemetry.channel_capacity",
        )?,
    })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let initial_ms = sync
        .initial_backoff_ms
        .unwrap_or(DEFAULT_SYNC_INITIAL_BACKOFF_MS);
    if initial_ms == 0 {
        return Err(LoadError::invalid(
            "sync.initial_backoff_ms",
            "must be greater than zero",
        ));
    }

    let max_ms = sync.max_backoff_ms.unwrap_or(DEFAULT_SYNC_MAX_BACKOFF_MS);
    if max_ms < initial_ms {
        return Err(LoadError::invalid(
            "sync.max_backoff_ms",
            "must not be smaller than sync.initial_backoff_ms",
        ));
    }

    let multiplier = sync
        .backoff_multiplier
        .unwrap_or(DEFAULT_SYNC_BACKOFF_MULTIPLIER);
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(LoadError::invalid(
            "sync.backoff_multiplier",
            "must be a finite number of at least 1.0",
        ));
    }

    let attempts = sync.max_attempts.unwrap_or(DEFAULT_SYNC_MAX_ATTEMPTS);

    Ok(SyncSettings {
        initial_backoff: Duration::from_millis(initial_ms),
        max_backoff: Duration::from_millis(max_ms),
        backoff_multiplier: multiplier,
        max_attempts: non_zero_u32(attempts, "sync.max_attempts")?,
        defer_failed_writes: sync.defer_failed_writes.unwrap_or(false),
        outbox_capacity: non_zero_usize(
            sync.outbox_capacity.unwrap_or(DEFAULT_SYNC_OUTBOX_CAPACITY),
            "sync.outbox_capacity",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    origin: Option<String>,
    network_first_timeout_ms: Option<u64>,
    transport_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<BackendKind>,
    directory: Option<PathBuf>,
    prefix: Option<String>,
    version: Option<String>,
    shell_path: Option<String>,
    offline_placeholder_path: Option<String>,
    critical_resources: Option<Vec<String>>,
    network_first_hosts: Option<Vec<String>>,
    cache_first_paths: Option<Vec<String>>,
    stale_while_revalidate_paths: Option<Vec<String>>,
    cache_only_paths: Option<Vec<String>>,
    api_paths: Option<Vec<String>>,
    realtime_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTelemetrySettings {
    broadcast_interval_seconds: Option<u64>,
    max_observers: Option<u64>,
    channel_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_attempts: Option<u64>,
    defer_failed_writes: Option<bool>,
    outbox_capacity: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Partition names embed prefix and version, so both must be safe file names.
fn validate_name_segment(value: &str, key: &'static str) -> Result<(), LoadError> {
    if value.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'))
    {
        return Err(LoadError::invalid(
            key,
            "may only contain ASCII letters, digits, `_` and `.`",
        ));
    }
    Ok(())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.upstream.origin.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(settings.upstream.network_first_timeout, Duration::from_secs(5));
        assert_eq!(settings.cache.backend, BackendKind::Memory);
        assert_eq!(settings.cache.prefix, "fetchward");
        assert_eq!(settings.telemetry.max_observers.get(), 16);
        assert_eq!(settings.sync.max_attempts.get(), 8);
        assert!(!settings.sync.defer_failed_writes);
        assert_eq!(settings.sync.outbox_capacity.get(), 256);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.cache.version = Some("v1".to_string());

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            store: StoreOverrides {
                cache_version: Some("v2".to_string()),
                cache_backend: Some(BackendKind::Disk),
                ..Default::default()
            },
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.cache.version, "v2");
        assert_eq!(settings.cache.backend, BackendKind::Disk);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn cache_config_follows_settings() {
        let mut raw = RawSettings::default();
        raw.upstream.network_first_timeout_ms = Some(1500);
        raw.cache.api_paths = Some(vec!["/v2/".to_string()]);
        let settings = Settings::from_raw(raw).expect("valid settings");

        let config = CacheConfig::from(&settings);
        assert_eq!(config.network_first_timeout(), Duration::from_millis(1500));
        assert_eq!(config.api_paths, vec!["/v2/"]);
        assert_eq!(config.cache_only_paths, CacheConfig::default().cache_only_paths);
    }

    #[test]
    fn rejects_version_with_separator() {
        let mut raw = RawSettings::default();
        raw.cache.version = Some("v1-beta".to_string());
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "cache.version", .. }));
    }

    #[test]
    fn rejects_non_http_origin() {
        let mut raw = RawSettings::default();
        raw.upstream.origin = Some("ftp://example.com".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_backoff_cap_below_initial() {
        let mut raw = RawSettings::default();
        raw.sync.initial_backoff_ms = Some(5000);
        raw.sync.max_backoff_ms = Some(100);
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "sync.max_backoff_ms", .. }));
    }

    #[test]
    fn rejects_zero_outbox_capacity() {
        let mut raw = RawSettings::default();
        raw.sync.outbox_capacity = Some(0);
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "sync.outbox_capacity", .. }));
    }

    #[test]
    fn zero_observers_is_invalid() {
        let mut raw = RawSettings::default();
        raw.telemetry.max_observers = Some(0);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["fetchward"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_fetch_arguments() {
        let args = CliArgs::parse_from([
            "fetchward",
            "fetch",
            "--navigate",
            "--cache-backend",
            "disk",
            "/api/profile",
        ]);

        match args.command.expect("fetch command") {
            Command::Fetch(fetch) => {
                assert!(fetch.navigate);
                assert_eq!(fetch.url, "/api/profile");
                assert_eq!(fetch.store.cache_backend, Some(BackendKind::Disk));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "fetchward",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--upstream-origin",
            "https://app.example.com",
            "--sync-defer-failed-writes",
            "true",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.store.upstream_origin.as_deref(),
                    Some("https://app.example.com")
                );
                assert_eq!(serve.overrides.defer_failed_writes, Some(true));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
