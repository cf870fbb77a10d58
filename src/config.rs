//! Configuration for the skymirror client and server.
//!
//! Configuration is loaded in layers with the following precedence (lowest to highest):
//! 1. Environment variables (SKYMIRROR_*)
//! 2. TOML configuration file
//! 3. Command-line arguments

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use skymirror_core::validate_key;
use skymirror_core::validate_pattern;
use skymirror_core::validate_token;
use skymirror_transport::KvServerConfig;
use skymirror_transport::parse_address;
use snafu::ResultExt;
use snafu::Snafu;

/// Settings for [`Client::connect`](crate::Client::connect) and [`bootstrap`](crate::bootstrap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name of the embedded leaf node.
    #[serde(default = "default_leaf_name")]
    pub leaf_name: String,

    /// Name of the local memory mirror bucket.
    #[serde(default = "default_mirror_bucket")]
    pub mirror_bucket: String,

    /// Name of the authoritative remote bucket, mirrored locally.
    #[serde(default = "default_source_bucket")]
    pub source_bucket: String,

    /// Domain of the leaf remote the mirror replicates through.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// URL of the remote store for direct reads, watches and publishes.
    #[serde(default = "default_remote_url")]
    pub remote_url: String,

    /// URL the leaf replicates from. Defaults to `remote_url`.
    pub leaf_url: Option<String>,

    /// Bearer credentials for the direct remote connection.
    pub credentials_file: Option<PathBuf>,

    /// Bearer credentials for the leaf remote. Defaults to `credentials_file`.
    pub leaf_credentials_file: Option<PathBuf>,

    /// Name announced to the remote store.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Timeout for connecting to the remote store, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Subject prefix for fetch triggers: `<prefix>.<flight_id>`.
    #[serde(default = "default_fetch_subject_prefix")]
    pub fetch_subject_prefix: String,

    #[serde(default)]
    pub warmup: WarmupConfig,
}

/// Startup warm-up pass settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Copy remote entries into the mirror before serving.
    #[serde(default)]
    pub enabled: bool,

    /// Key pattern to warm.
    #[serde(default = "default_warmup_filter")]
    pub filter: String,

    /// Upper bound on the whole pass, in milliseconds.
    #[serde(default = "default_warmup_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: default_warmup_filter(),
            timeout_ms: default_warmup_timeout_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            leaf_name: default_leaf_name(),
            mirror_bucket: default_mirror_bucket(),
            source_bucket: default_source_bucket(),
            domain: default_domain(),
            remote_url: default_remote_url(),
            leaf_url: None,
            credentials_file: None,
            leaf_credentials_file: None,
            client_name: default_client_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            fetch_subject_prefix: default_fetch_subject_prefix(),
            warmup: WarmupConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables follow the pattern SKYMIRROR_<FIELD_NAME> (uppercase).
    /// Warm-up fields use SKYMIRROR_WARMUP_<FIELD_NAME>.
    pub fn from_env() -> Self {
        Self {
            leaf_name: parse_env("SKYMIRROR_LEAF_NAME").unwrap_or_else(default_leaf_name),
            mirror_bucket: parse_env("SKYMIRROR_MIRROR_BUCKET").unwrap_or_else(default_mirror_bucket),
            source_bucket: parse_env("SKYMIRROR_SOURCE_BUCKET").unwrap_or_else(default_source_bucket),
            domain: parse_env("SKYMIRROR_DOMAIN").unwrap_or_else(default_domain),
            remote_url: parse_env("SKYMIRROR_REMOTE_URL").unwrap_or_else(default_remote_url),
            leaf_url: parse_env("SKYMIRROR_LEAF_URL"),
            credentials_file: parse_env("SKYMIRROR_CREDENTIALS_FILE"),
            leaf_credentials_file: parse_env("SKYMIRROR_LEAF_CREDENTIALS_FILE"),
            client_name: parse_env("SKYMIRROR_CLIENT_NAME").unwrap_or_else(default_client_name),
            connect_timeout_ms: parse_env("SKYMIRROR_CONNECT_TIMEOUT_MS").unwrap_or_else(default_connect_timeout_ms),
            fetch_subject_prefix: parse_env("SKYMIRROR_FETCH_SUBJECT_PREFIX")
                .unwrap_or_else(default_fetch_subject_prefix),
            warmup: WarmupConfig {
                enabled: parse_env("SKYMIRROR_WARMUP_ENABLED").unwrap_or(false),
                filter: parse_env("SKYMIRROR_WARMUP_FILTER").unwrap_or_else(default_warmup_filter),
                timeout_ms: parse_env("SKYMIRROR_WARMUP_TIMEOUT_MS").unwrap_or_else(default_warmup_timeout_ms),
            },
        }
    }

    /// Merge configuration from another source.
    ///
    /// Fields in `other` that are `Some` or non-default override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.leaf_name != default_leaf_name() {
            self.leaf_name = other.leaf_name;
        }
        if other.mirror_bucket != default_mirror_bucket() {
            self.mirror_bucket = other.mirror_bucket;
        }
        if other.source_bucket != default_source_bucket() {
            self.source_bucket = other.source_bucket;
        }
        if other.domain != default_domain() {
            self.domain = other.domain;
        }
        if other.remote_url != default_remote_url() {
            self.remote_url = other.remote_url;
        }
        if other.leaf_url.is_some() {
            self.leaf_url = other.leaf_url;
        }
        if other.credentials_file.is_some() {
            self.credentials_file = other.credentials_file;
        }
        if other.leaf_credentials_file.is_some() {
            self.leaf_credentials_file = other.leaf_credentials_file;
        }
        if other.client_name != default_client_name() {
            self.client_name = other.client_name;
        }
        if other.connect_timeout_ms != default_connect_timeout_ms() {
            self.connect_timeout_ms = other.connect_timeout_ms;
        }
        if other.fetch_subject_prefix != default_fetch_subject_prefix() {
            self.fetch_subject_prefix = other.fetch_subject_prefix;
        }
        if other.warmup.enabled {
            self.warmup.enabled = true;
        }
        if other.warmup.filter != default_warmup_filter() {
            self.warmup.filter = other.warmup.filter;
        }
        if other.warmup.timeout_ms != default_warmup_timeout_ms() {
            self.warmup.timeout_ms = other.warmup.timeout_ms;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, name) in [
            ("leaf_name", &self.leaf_name),
            ("mirror_bucket", &self.mirror_bucket),
            ("source_bucket", &self.source_bucket),
            ("domain", &self.domain),
        ] {
            if let Err(err) = validate_token(name) {
                return Err(ConfigError::Validation {
                    message: format!("{field} '{name}' is invalid: {err}"),
                });
            }
        }

        if let Err(err) = parse_address(&self.remote_url) {
            return Err(ConfigError::Validation {
                message: err.to_string(),
            });
        }
        if let Some(leaf_url) = &self.leaf_url {
            if let Err(err) = parse_address(leaf_url) {
                return Err(ConfigError::Validation {
                    message: format!("leaf_url: {err}"),
                });
            }
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "connect_timeout_ms must be non-zero".into(),
            });
        }

        if let Err(err) = validate_key(&self.fetch_subject_prefix) {
            return Err(ConfigError::Validation {
                message: format!("fetch_subject_prefix is invalid: {err}"),
            });
        }

        if self.warmup.enabled {
            if self.warmup.timeout_ms == 0 {
                return Err(ConfigError::Validation {
                    message: "warmup.timeout_ms must be non-zero when warm-up is enabled".into(),
                });
            }
            if let Err(err) = validate_pattern(&self.warmup.filter) {
                return Err(ConfigError::Validation {
                    message: format!("warmup.filter is invalid: {err}"),
                });
            }
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// URL the leaf replicates from.
    pub fn leaf_url(&self) -> &str {
        self.leaf_url.as_deref().unwrap_or(&self.remote_url)
    }

    /// Credentials file for the leaf remote.
    pub fn leaf_credentials_file(&self) -> Option<&Path> {
        self.leaf_credentials_file.as_deref().or(self.credentials_file.as_deref())
    }
}

/// Load a server configuration from a TOML file.
pub fn load_server_config(path: &Path) -> Result<KvServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    toml::from_str(&content).context(ParseTomlSnafu { path })
}

/// Validate a server configuration.
pub fn validate_server_config(config: &KvServerConfig) -> Result<(), ConfigError> {
    if config.buckets.is_empty() {
        return Err(ConfigError::Validation {
            message: "at least one bucket must be configured".into(),
        });
    }
    for bucket in &config.buckets {
        if let Err(err) = validate_token(bucket) {
            return Err(ConfigError::Validation {
                message: format!("bucket '{bucket}' is invalid: {err}"),
            });
        }
    }
    if config.max_connections == 0 {
        return Err(ConfigError::Validation {
            message: "max_connections must be non-zero".into(),
        });
    }
    if matches!(&config.token, Some(token) if token.trim().is_empty()) {
        return Err(ConfigError::Validation {
            message: "token must not be empty when set".into(),
        });
    }
    Ok(())
}

// Default value functions
fn default_leaf_name() -> String {
    "FlightApp_LeafNode".into()
}

fn default_mirror_bucket() -> String {
    "inMemoryFlights".into()
}

fn default_source_bucket() -> String {
    "flights".into()
}

fn default_domain() -> String {
    "ngs".into()
}

fn default_remote_url() -> String {
    "tcp://127.0.0.1:4222".into()
}

fn default_client_name() -> String {
    "skymirror-node".into()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_subject_prefix() -> String {
    "api.flightaware.fetch".into()
}

fn default_warmup_filter() -> String {
    ">".into()
}

fn default_warmup_timeout_ms() -> u64 {
    30_000
}

// Helper function for parsing environment variables
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}
