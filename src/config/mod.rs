//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::util::bytes::{MemorySize, parse_memory_size, system_memory_bytes};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "qrcache";
const ENV_PREFIX: &str = "QRCACHE";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_PORT: u16 = 9400;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_CLEAN_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CACHE_MAX_SIZE: &str = "1%";
const DEFAULT_CACHE_CONCURRENCY_LEVEL: u64 = 16;
const DEFAULT_CACHE_RETRY_BACKOFF_MS: u64 = 1_000;

/// Command-line arguments for the qrcache binary.
#[derive(Debug, Parser)]
#[command(name = "qrcache", version, about = "Shard query result cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QRCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine and its admin HTTP surface.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the administrative listener host.
    #[arg(long = "admin-host", value_name = "HOST")]
    pub admin_host: Option<String>,

    /// Override the administrative listener port.
    #[arg(long = "admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

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

    /// Override the cache size bound (`1%`, `256mb`, `1073741824`).
    #[arg(long = "cache-max-size", value_name = "SIZE")]
    pub cache_max_size: Option<String>,

    /// Override the sweep interval.
    #[arg(long = "cache-clean-interval-ms", value_name = "MILLIS")]
    pub cache_clean_interval_ms: Option<u64>,

    /// Override the access expiry; zero disables it.
    #[arg(long = "cache-expire-ms", value_name = "MILLIS")]
    pub cache_expire_ms: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_addr: SocketAddr,
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
pub struct CacheSettings {
    pub clean_interval: Duration,
    /// The bound as configured, before resolving percentages.
    pub max_size: MemorySize,
    pub max_weight_bytes: u64,
    pub expire: Option<Duration>,
    pub concurrency_level: NonZeroUsize,
    pub retry_backoff: Duration,
    /// Indices registered with caching enabled at startup.
    pub enabled_indices: Vec<String>,
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
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.enabled_indices")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(size) = overrides.cache_max_size.as_ref() {
            self.cache.max_size = Some(size.clone());
        }
        if let Some(interval) = overrides.cache_clean_interval_ms {
            self.cache.clean_interval_ms = Some(interval);
        }
        if let Some(expire) = overrides.cache_expire_ms {
            self.cache.expire_ms = Some(expire);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

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
        admin_addr,
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let clean_interval_ms = cache
        .clean_interval_ms
        .unwrap_or(DEFAULT_CACHE_CLEAN_INTERVAL_MS);
    if clean_interval_ms == 0 {
        return Err(LoadError::invalid(
            "cache.clean_interval_ms",
            "must be greater than zero",
        ));
    }

    let max_size_raw = cache
        .max_size
        .unwrap_or_else(|| DEFAULT_CACHE_MAX_SIZE.to_string());
    let max_size = parse_memory_size(&max_size_raw)
        .map_err(|reason| LoadError::invalid("cache.max_size", reason))?;

    let reference = match cache.memory_reference_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.memory_reference_bytes",
                "must be greater than zero",
            ));
        }
        Some(bytes) => bytes,
        None => system_memory_bytes(),
    };
    let max_weight_bytes = max_size.resolve(reference);
    if max_weight_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.max_size",
            format!("`{max_size_raw}` resolves to zero bytes"),
        ));
    }

    let expire_ms = cache.expire_ms.unwrap_or(0);
    let expire = (expire_ms > 0).then(|| Duration::from_millis(expire_ms));

    let concurrency_level = non_zero_usize(
        cache
            .concurrency_level
            .unwrap_or(DEFAULT_CACHE_CONCURRENCY_LEVEL),
        "cache.concurrency_level",
    )?;

    let retry_backoff_ms = cache
        .retry_backoff_ms
        .unwrap_or(DEFAULT_CACHE_RETRY_BACKOFF_MS);
    if retry_backoff_ms == 0 {
        return Err(LoadError::invalid(
            "cache.retry_backoff_ms",
            "must be greater than zero",
        ));
    }

    let enabled_indices = cache
        .enabled_indices
        .into_iter()
        .map(|index| index.trim().to_string())
        .filter(|index| !index.is_empty())
        .collect();

    Ok(CacheSettings {
        clean_interval: Duration::from_millis(clean_interval_ms),
        max_size,
        max_weight_bytes,
        expire,
        concurrency_level,
        retry_backoff: Duration::from_millis(retry_backoff_ms),
        enabled_indices,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    admin_host: Option<String>,
    admin_port: Option<u16>,
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
struct RawCacheSettings {
    clean_interval_ms: Option<u64>,
    max_size: Option<String>,
    memory_reference_bytes: Option<u64>,
    expire_ms: Option<u64>,
    concurrency_level: Option<u64>,
    retry_backoff_ms: Option<u64>,
    enabled_indices: Vec<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
