//! Process-wide gateway configuration.
//!
//! The configuration is a JSON file loaded once at boot and treated as
//! an immutable snapshot; a reload builds a fresh snapshot and swaps it
//! atomically. Unknown fields are ignored so config files can carry
//! options for newer gateway builds.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, io, path::Path};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    /// Shared secret protecting the control endpoints.
    pub secret: String,
    /// Directory holding API definition JSON files.
    pub app_path: String,
    pub storage: StorageConfig,
    pub enable_analytics: bool,
    pub analytics_config: AnalyticsConfig,
    pub health_check: HealthCheckConfig,
    pub use_async_session_write: bool,
    pub allow_master_keys: bool,
    pub hash_keys: bool,
    pub enforce_org_quotas: bool,
    pub oauth_refresh_token_expire: i64,
    pub monitor: MonitorConfig,
    pub slave_options: SlaveOptions,
    pub http_server_options: HttpServerOptions,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            secret: "352d20ee67be67f6340b4c0605b044b7".to_string(),
            app_path: "./apps/".to_string(),
            storage: StorageConfig::default(),
            enable_analytics: false,
            analytics_config: AnalyticsConfig::default(),
            health_check: HealthCheckConfig::default(),
            use_async_session_write: false,
            allow_master_keys: false,
            hash_keys: false,
            enforce_org_quotas: false,
            oauth_refresh_token_expire: 0,
            monitor: MonitorConfig::default(),
            slave_options: SlaveOptions::default(),
            http_server_options: HttpServerOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    /// host -> port map for cluster mode.
    pub hosts: HashMap<String, String>,
    pub username: String,
    pub password: String,
    pub database: i64,
    pub max_idle: u32,
    pub max_active: u32,
    pub enable_cluster: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: "redis".to_string(),
            host: "localhost".to_string(),
            port: 6379,
            hosts: HashMap::new(),
            username: String::new(),
            password: String::new(),
            database: 0,
            max_idle: 100,
            max_active: 500,
            enable_cluster: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub purge_delay: i64,
    /// Client IPs whose requests are never recorded.
    pub ignored_ips: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enable_health_checks: bool,
    pub health_check_value_timeouts: i64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enable_health_checks: true, health_check_value_timeouts: 60 }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enable_trigger_monitors: bool,
    pub global_trigger_limit: f64,
    pub monitor_user_keys: bool,
    pub monitor_org_keys: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveOptions {
    pub use_rpc: bool,
    pub connection_string: String,
    pub rpc_key: String,
    pub api_key: String,
    pub enable_rpc_cache: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerOptions {
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub use_ssl: bool,
    pub certificates: Vec<CertData>,
    pub flush_interval: u64,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: 120,
            write_timeout: 120,
            use_ssl: false,
            certificates: Vec::new(),
            flush_interval: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CertData {
    pub domain_name: String,
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing file is not an
    /// error: the compiled defaults are written to that path and read
    /// back, so a fresh install starts with a usable, editable file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "configuration missing, writing defaults");
                Self::write_default(path)?;
                fs::read_to_string(path)?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        let defaults = Self::default();
        fs::write(path, serde_json::to_string_pretty(&defaults)?)?;
        Ok(())
    }
}
