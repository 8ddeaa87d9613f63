//! Configuration Module
//!
//! Handles configuration loading from YAML files, environment variables, and command-line
//! arguments. Layers are merged key-by-key, later layers overriding earlier ones:
//!
//! ```text
//! defaults -> ~/.config/s3-build-cache/config.yaml -> --config FILE -> S3_CACHE_* -> CLI
//! ```
//!
//! A partial override of a nested section keeps the sibling keys of that section.

use crate::{ProxyError, Result};
use clap::{Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const APP_NAME: &str = "s3-build-cache";

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if path == "~" || path.starts_with("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                if path.len() > 2 {
                    result.push(&path[2..]);
                }
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Text(String),
        Seconds(f64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
            RawDuration::Seconds(secs) if secs >= 0.0 && secs.is_finite() => {
                Ok(Duration::from_secs_f64(secs))
            }
            RawDuration::Seconds(secs) => Err(serde::de::Error::custom(format!(
                "Duration must be a non-negative number of seconds, got {}",
                secs
            ))),
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub async_upload: AsyncUploadConfig,
    /// Largest PUT body forwarded to the store; 0 means unlimited
    #[serde(default)]
    pub max_entry_size_bytes: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Serve gcc dependency listings fetched from the store
    #[serde(default)]
    pub allow_gcc_depfiles: bool,
    /// Hide transient store failures from the build tool
    #[serde(default = "default_true")]
    pub allow_offline: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// A request that has not been answered by then gets a 404 and a closed connection
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_socket_timeout"
    )]
    pub socket_timeout: Duration,
    /// Shut down after this long without requests; 0 disables
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_idle_timeout"
    )]
    pub idle_timeout: Duration,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_timeout: default_socket_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Remote object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
}

fn default_endpoint() -> String {
    "http://s3.amazonaws.com".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: default_endpoint(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// In-memory cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entry_size_bytes")]
    pub max_entry_size_bytes: u64,
    #[serde(default = "default_cache_max_total_size_bytes")]
    pub max_total_size_bytes: u64,
}

fn default_cache_max_entry_size_bytes() -> u64 {
    1_000_000
}

fn default_cache_max_total_size_bytes() -> u64 {
    50_000_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entry_size_bytes: default_cache_max_entry_size_bytes(),
            max_total_size_bytes: default_cache_max_total_size_bytes(),
        }
    }
}

/// Upload pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncUploadConfig {
    /// Acknowledge PUTs before the store has them
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Staging directory for uploads in flight; cleared at startup and shutdown
    #[serde(
        deserialize_with = "pathbuf_serde::deserialize",
        default = "default_upload_cache_dir"
    )]
    pub cache_dir: PathBuf,
    #[serde(default = "default_max_pending_upload_mb")]
    pub max_pending_upload_mb: u64,
}

fn default_upload_cache_dir() -> PathBuf {
    pathbuf_serde::expand_tilde(&format!("~/.cache/{}/uploads", APP_NAME))
}

fn default_max_pending_upload_mb() -> u64 {
    200
}

impl Default for AsyncUploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: default_upload_cache_dir(),
            max_pending_upload_mb: default_max_pending_upload_mb(),
        }
    }
}

/// Remote store circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_errors_before_pausing")]
    pub errors_before_pausing: u32,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_pause_duration"
    )]
    pub pause_duration: Duration,
}

fn default_errors_before_pausing() -> u32 {
    3
}

fn default_pause_duration() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            errors_before_pausing: default_errors_before_pausing(),
            pause_duration: default_pause_duration(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(
        deserialize_with = "pathbuf_serde::deserialize",
        default = "default_log_dir"
    )]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_dir() -> PathBuf {
    pathbuf_serde::expand_tilde(&format!("~/.cache/{}/logs", APP_NAME))
}

fn default_log_file() -> String {
    format!("{}.log", APP_NAME)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            async_upload: AsyncUploadConfig::default(),
            max_entry_size_bytes: 0,
            circuit_breaker: CircuitBreakerConfig::default(),
            allow_gcc_depfiles: false,
            allow_offline: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// How an override's raw text becomes a YAML value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverrideKind {
    /// Always a string, even if it looks like a number
    Text,
    /// Booleans and numbers are recognized, anything else is a string
    Scalar,
}

/// Environment variables and the config paths they override
const ENV_OVERRIDES: &[(&str, &str, OverrideKind)] = &[
    ("S3_CACHE_BUCKET", "store.bucket", OverrideKind::Text),
    ("S3_CACHE_ENDPOINT", "store.endpoint", OverrideKind::Text),
    ("S3_CACHE_HOST", "server.host", OverrideKind::Text),
    ("S3_CACHE_PORT", "server.port", OverrideKind::Scalar),
    ("S3_CACHE_IDLE_TIMEOUT", "server.idle_timeout", OverrideKind::Text),
    ("S3_CACHE_UPLOAD_DIR", "async_upload.cache_dir", OverrideKind::Text),
    ("S3_CACHE_ASYNC_UPLOAD", "async_upload.enabled", OverrideKind::Scalar),
    ("S3_CACHE_ALLOW_OFFLINE", "allow_offline", OverrideKind::Scalar),
    ("S3_CACHE_LOG_DIR", "logging.log_dir", OverrideKind::Text),
    ("S3_CACHE_LOG_LEVEL", "logging.log_level", OverrideKind::Text),
];

/// Command-line options and the config paths they override
const CLI_OVERRIDES: &[(&str, &str, OverrideKind)] = &[
    ("bucket", "store.bucket", OverrideKind::Text),
    ("endpoint", "store.endpoint", OverrideKind::Text),
    ("host", "server.host", OverrideKind::Text),
    ("port", "server.port", OverrideKind::Scalar),
    ("idle-timeout", "server.idle_timeout", OverrideKind::Text),
    ("cache-dir", "async_upload.cache_dir", OverrideKind::Text),
    ("log-dir", "logging.log_dir", OverrideKind::Text),
    ("log-level", "logging.log_level", OverrideKind::Text),
];

impl Config {
    /// Load configuration from files, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::load_layers(
            &matches,
            Self::user_config_path().as_deref(),
            |name| std::env::var(name).ok(),
        )
    }

    /// Load configuration from explicit arguments, skipping the user config file and the
    /// process environment
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;
        Self::load_layers(&matches, None, |_| None)
    }

    fn load_layers<F>(
        matches: &clap::ArgMatches,
        user_config: Option<&Path>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layered = Value::Mapping(Mapping::new());

        if let Some(path) = user_config.filter(|path| path.exists()) {
            merge_values(&mut layered, Self::read_yaml_file(path)?);
        }

        if let Some(config_path) = matches.get_one::<String>("config") {
            merge_values(&mut layered, Self::read_yaml_file(Path::new(config_path))?);
        }

        Self::apply_env_overrides(&mut layered, env);
        Self::apply_cli_overrides(&mut layered, matches)?;

        let config: Self = serde_yaml::from_value(layered)
            .map_err(|e| ProxyError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single YAML document on top of the defaults
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-user config file, if a home directory is known
    pub fn user_config_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join(APP_NAME)
                .join("config.yaml")
        })
    }

    fn build_cli() -> Command {
        Command::new(APP_NAME)
            .version(env!("CARGO_PKG_VERSION"))
            .about("Local caching proxy between a build tool and an S3-compatible object store")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("bucket")
                    .short('b')
                    .long("bucket")
                    .value_name("BUCKET")
                    .help("Bucket holding the cache entries (required)"),
            )
            .arg(
                Arg::new("endpoint")
                    .long("endpoint")
                    .value_name("URL")
                    .help("Object store endpoint (default: http://s3.amazonaws.com)"),
            )
            .arg(
                Arg::new("host")
                    .long("host")
                    .value_name("HOST")
                    .help("Listen address (default: localhost)"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Listen port (default: 7777)"),
            )
            .arg(
                Arg::new("idle-timeout")
                    .long("idle-timeout")
                    .value_name("DURATION")
                    .help("Shut down after this long without requests, 0 disables (default: 30m)"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Upload staging directory"),
            )
            .arg(
                Arg::new("log-dir")
                    .long("log-dir")
                    .value_name("DIR")
                    .help("Log directory"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: error, warn, info, debug, trace (default: info)"),
            )
            .arg(
                Arg::new("no-cache")
                    .long("no-cache")
                    .action(ArgAction::SetTrue)
                    .help("Disable the in-memory cache"),
            )
            .arg(
                Arg::new("sync-upload")
                    .long("sync-upload")
                    .action(ArgAction::SetTrue)
                    .help("Wait for the object store before acknowledging PUTs"),
            )
            .arg(
                Arg::new("set")
                    .long("set")
                    .value_name("KEY=VALUE")
                    .action(ArgAction::Append)
                    .help("Override any setting by dotted path, e.g. --set cache.max_total_size_bytes=1000"),
            )
    }

    /// Load a YAML layer; an empty file is an empty layer
    fn read_yaml_file(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let value: Value = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        info!("Configuration loaded from file: {}", path.display());
        match value {
            Value::Null => Ok(Value::Mapping(Mapping::new())),
            Value::Mapping(_) => Ok(value),
            _ => Err(ProxyError::ConfigError(format!(
                "Config file {} must contain a mapping",
                path.display()
            ))),
        }
    }

    fn apply_env_overrides<F>(layered: &mut Value, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, path, kind) in ENV_OVERRIDES {
            if let Some(raw) = env(name) {
                set_path(layered, path, override_value(&raw, *kind));
            }
        }
    }

    fn apply_cli_overrides(layered: &mut Value, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(assignments) = matches.get_many::<String>("set") {
            for assignment in assignments {
                let (path, raw) = assignment.split_once('=').ok_or_else(|| {
                    ProxyError::ConfigError(format!(
                        "Expected KEY=VALUE for --set, got '{}'",
                        assignment
                    ))
                })?;
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(ProxyError::ConfigError(format!(
                        "Invalid setting path '{}'",
                        path
                    )));
                }
                set_path(layered, path, override_value(raw, OverrideKind::Scalar));
            }
        }

        for (arg, path, kind) in CLI_OVERRIDES {
            if let Some(raw) = matches.get_one::<String>(arg) {
                set_path(layered, path, override_value(raw, *kind));
            }
        }

        if matches.get_flag("no-cache") {
            set_path(layered, "cache.enabled", Value::Bool(false));
        }

        if matches.get_flag("sync-upload") {
            set_path(layered, "async_upload.enabled", Value::Bool(false));
        }

        Ok(())
    }

    /// Validate the merged configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.trim().is_empty() {
            return Err(ProxyError::ConfigError(format!(
                "S3 bucket is required, e.g. '{} --bucket <bucketname>'",
                APP_NAME
            )));
        }

        if self.server.port < 1024 {
            return Err(ProxyError::ConfigError(
                "Port must be in the range 1024..65535".to_string(),
            ));
        }

        if self.cache.max_entry_size_bytes > self.cache.max_total_size_bytes {
            return Err(ProxyError::ConfigError(format!(
                "max entry size ({}) must be <= max total size ({})",
                self.cache.max_entry_size_bytes, self.cache.max_total_size_bytes
            )));
        }

        if self.circuit_breaker.errors_before_pausing == 0 {
            return Err(ProxyError::ConfigError(
                "circuit_breaker.errors_before_pausing must be at least 1".to_string(),
            ));
        }

        if self.server.socket_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "server.socket_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Byte ceiling of the pending upload budget
    pub fn pending_upload_ceiling_bytes(&self) -> u64 {
        self.async_upload
            .max_pending_upload_mb
            .saturating_mul(1024 * 1024)
    }

    /// Idle shutdown timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        Some(self.server.idle_timeout).filter(|timeout| !timeout.is_zero())
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logging.log_dir.join(&self.logging.log_file)
    }
}

fn override_value(raw: &str, kind: OverrideKind) -> Value {
    if kind == OverrideKind::Scalar {
        if let Ok(value @ (Value::Bool(_) | Value::Number(_))) = serde_yaml::from_str::<Value>(raw)
        {
            return value;
        }
    }
    Value::String(raw.to_string())
}

/// Set a dotted path (`cache.enabled`) inside a layered mapping
fn set_path(layered: &mut Value, path: &str, leaf: Value) {
    let overlay = path.rsplit('.').fold(leaf, |inner, segment| {
        let mut mapping = Mapping::new();
        mapping.insert(Value::String(segment.to_string()), inner);
        Value::Mapping(mapping)
    });
    merge_values(layered, overlay);
}

/// Merge `overlay` into `target`; mappings merge key-by-key, anything else replaces
fn merge_values(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Mapping(target_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, overlay) => *target = overlay,
    }
}
