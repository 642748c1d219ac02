use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Result, TdbError};

/// Top-level configuration loaded from a TOML file.
///
/// Every field can be overridden by a `TIDEPOOL_*` environment variable;
/// see [`Config::apply_env`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server identity and listen addresses.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// HTTP status / API configuration (optional).
    #[serde(default)]
    pub http: HttpConfig,
}

/// Server identity and network binding.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Name shown in cluster listings, e.g. "server0".
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Address to bind the client listener on.
    #[serde(default = "default_bind")]
    pub bind_client_address: String,
    /// Address to bind the server (peer) listener on.
    #[serde(default = "default_bind")]
    pub bind_server_address: String,
    /// Client-facing port.
    #[serde(default = "default_client_port")]
    pub listen_client_port: u16,
    /// Peer-facing port.
    #[serde(default = "default_server_port")]
    pub listen_server_port: u16,
    /// IP stack selection: ALL, IPV4ONLY or IPV6ONLY.
    #[serde(default = "default_ip_support")]
    pub ip_support: String,
    /// Whether to accept clients over a named pipe as well.
    #[serde(default)]
    pub enable_pipe_support: bool,
    /// Pipe name when pipe support is enabled.
    #[serde(default = "default_pipe_name")]
    pub pipe_client_name: String,
}

/// HTTP status endpoint and JSON API mirror.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port of the health/status listener; 0 disables it.
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    /// Port of the JSON API mirror; 0 disables it.
    #[serde(default)]
    pub api_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { status_port: default_status_port(), api_port: 0 }
    }
}

/// Storage parameters shared by all databases on this server.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory holding one subdirectory per database.
    pub db_path: PathBuf,
    /// Requested buffer slot size in bytes; when it differs from a
    /// database's stored size a one-shot migration runs at open.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// High-water mark for the shard file handle cache.
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    /// Compress shard chunks on write.
    #[serde(default = "default_true")]
    pub enable_shard_compression: bool,
    /// Derive shard duration from the observed insert rate.
    #[serde(default)]
    pub enable_shard_auto_duration: bool,
    /// Delete a leftover temporary buffer instead of refusing to start.
    #[serde(default)]
    pub ignore_broken_data: bool,
    /// Buffer fsync interval in milliseconds (0 disables, max 300000).
    #[serde(default = "default_buffer_sync")]
    pub buffer_sync_interval_ms: u64,
    /// Heartbeat interval in seconds (3..=300).
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_s: u64,
    /// Optimize interval in seconds (0 disables, max 2419200).
    #[serde(default = "default_optimize")]
    pub optimize_interval_s: u64,
}

fn default_server_name() -> String { "server0".into() }
fn default_bind() -> String { "0.0.0.0".into() }
fn default_client_port() -> u16 { 9000 }
fn default_server_port() -> u16 { 9010 }
fn default_ip_support() -> String { "ALL".into() }
fn default_pipe_name() -> String { "tidepool_client.sock".into() }
fn default_status_port() -> u16 { 8080 }
fn default_max_open_files() -> usize { 32768 }
fn default_true() -> bool { true }
fn default_buffer_sync() -> u64 { 500 }
fn default_heartbeat() -> u64 { 30 }
fn default_optimize() -> u64 { 3600 }

impl Config {
    /// Load configuration from a TOML file at `path`, apply environment
    /// overrides, then validate.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TdbError::Config(format!("Cannot read config file: {e}")))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| TdbError::Config(format!("Invalid TOML: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TIDEPOOL_*` environment variable overrides on top of the
    /// file values. Unparsable values are ignored with the file value kept.
    pub fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }
        if let Some(v) = env_parse("TIDEPOOL_LISTEN_CLIENT_PORT") {
            self.server.listen_client_port = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_HTTP_STATUS_PORT") {
            self.http.status_port = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_HTTP_API_PORT") {
            self.http.api_port = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_MAX_OPEN_FILES") {
            self.storage.max_open_files = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_ENABLE_PIPE_SUPPORT") {
            self.server.enable_pipe_support = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_ENABLE_SHARD_COMPRESSION") {
            self.storage.enable_shard_compression = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_ENABLE_SHARD_AUTO_DURATION") {
            self.storage.enable_shard_auto_duration = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_IGNORE_BROKEN_DATA") {
            self.storage.ignore_broken_data = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("TIDEPOOL_BUFFER_SYNC_INTERVAL") {
            self.storage.buffer_sync_interval_ms = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_HEARTBEAT_INTERVAL") {
            self.storage.heartbeat_interval_s = v;
        }
        if let Some(v) = env_parse("TIDEPOOL_OPTIMIZING_INTERVAL") {
            self.storage.optimize_interval_s = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_IP_SUPPORT") {
            self.server.ip_support = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_BIND_CLIENT_ADDRESS") {
            self.server.bind_client_address = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_BIND_SERVER_ADDRESS") {
            self.server.bind_server_address = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_PIPE_CLIENT_NAME") {
            self.server.pipe_client_name = v;
        }
        if let Some(v) = env_parse::<String>("TIDEPOOL_SERVER_NAME") {
            self.server.name = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(TdbError::Config("server name must not be empty".into()));
        }
        match self.server.ip_support.as_str() {
            "ALL" | "IPV4ONLY" | "IPV6ONLY" => {}
            other => {
                return Err(TdbError::Config(format!(
                    "ip_support must be ALL, IPV4ONLY or IPV6ONLY, got '{other}'"
                )));
            }
        }
        if self.storage.buffer_sync_interval_ms > 300_000 {
            return Err(TdbError::Config(
                "buffer_sync_interval_ms must be 0..=300000".into(),
            ));
        }
        if !(3..=300).contains(&self.storage.heartbeat_interval_s) {
            return Err(TdbError::Config(
                "heartbeat_interval_s must be 3..=300".into(),
            ));
        }
        if self.storage.optimize_interval_s > 2_419_200 {
            return Err(TdbError::Config(
                "optimize_interval_s must be 0..=2419200".into(),
            ));
        }
        if self.storage.max_open_files == 0 {
            return Err(TdbError::Config("max_open_files must be > 0".into()));
        }
        Ok(())
    }
}
