use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for tapir
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from TAPIR_CONFIG env var first
        if let Ok(config_path) = std::env::var("TAPIR_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/tapir/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.server.port == 0 {
            return Err(Error::Config("Invalid server port".to_string()));
        }

        if self.database.pool_size == 0 {
            return Err(Error::Config(
                "Database pool size must be at least 1".to_string(),
            ));
        }

        if self.service.default_destruction_interval == 0 {
            return Err(Error::Config(
                "Default destruction interval must be positive".to_string(),
            ));
        }

        if self.service.max_execution_duration > 0
            && self.service.default_execution_duration > self.service.max_execution_duration
        {
            return Err(Error::Config(
                "Default execution duration exceeds the maximum".to_string(),
            ));
        }

        if self.service.storage_dir.as_os_str().is_empty() {
            return Err(Error::Config("Storage directory must be set".to_string()));
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// PostgreSQL connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_name")]
    pub database: String,

    #[serde(default = "default_db_user")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Size of the connection pool; also the hard ceiling on
    /// simultaneously executing queries
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            username: default_db_user(),
            password: String::new(),
            pool_size: default_pool_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-formatted log records
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// TAP service limits and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum rows a query may return; -1 means unlimited
    #[serde(default = "default_max_rec")]
    pub max_rec: i64,

    /// Default MAXREC applied when the client sends none
    #[serde(default = "default_max_rec")]
    pub default_max_rec: i64,

    /// Default wall-clock budget for a job, in seconds
    #[serde(default = "default_execution_duration")]
    pub default_execution_duration: u64,

    /// Hard cap on the wall-clock budget; 0 means no cap
    #[serde(default = "default_max_execution_duration")]
    pub max_execution_duration: u64,

    /// Seconds between job creation and its default destruction time
    #[serde(default = "default_destruction_interval")]
    pub default_destruction_interval: u64,

    /// Hard cap on the destruction interval; 0 means no cap
    #[serde(default)]
    pub max_destruction_interval: u64,

    /// Upper bound applied to blocking-poll WAIT requests, in seconds
    #[serde(default = "default_wait_cap")]
    pub wait_cap: u64,

    /// Maximum number of concurrently executing async jobs;
    /// 0 or negative means unbounded (the pool still gates admission)
    #[serde(default = "default_max_async_jobs")]
    pub max_async_jobs: i32,

    /// Time budget for a synchronous request, in seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout: u64,

    /// Grace period granted to a cancelled worker before it is
    /// declared leaked, in seconds
    #[serde(default = "default_stop_wait")]
    pub stop_wait: u64,

    /// Whether table uploads are accepted
    #[serde(default = "default_true")]
    pub uploads_enabled: bool,

    /// Database schema holding uploaded temporary tables
    #[serde(default = "default_upload_schema")]
    pub upload_schema: String,

    /// Directory for per-job artifacts (results, backups)
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Persist jobs to disk and restore them at startup
    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Short alias of the format used when the client sends none
    #[serde(default = "default_format")]
    pub default_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_rec: default_max_rec(),
            default_max_rec: default_max_rec(),
            default_execution_duration: default_execution_duration(),
            max_execution_duration: default_max_execution_duration(),
            default_destruction_interval: default_destruction_interval(),
            max_destruction_interval: 0,
            wait_cap: default_wait_cap(),
            max_async_jobs: default_max_async_jobs(),
            sync_timeout: default_sync_timeout(),
            stop_wait: default_stop_wait(),
            uploads_enabled: true,
            upload_schema: default_upload_schema(),
            storage_dir: default_storage_dir(),
            backup_enabled: true,
            default_format: default_format(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "tapir".to_string()
}

fn default_db_user() -> String {
    "tapir".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_rec() -> i64 {
    100_000
}

fn default_execution_duration() -> u64 {
    600
}

fn default_max_execution_duration() -> u64 {
    3600
}

fn default_destruction_interval() -> u64 {
    7 * 24 * 3600
}

fn default_wait_cap() -> u64 {
    60
}

fn default_max_async_jobs() -> i32 {
    4
}

fn default_sync_timeout() -> u64 {
    60
}

fn default_stop_wait() -> u64 {
    10
}

fn default_upload_schema() -> String {
    "tap_upload".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./tapir-data")
}

fn default_format() -> String {
    "votable".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service.wait_cap, 60);
        assert_eq!(config.service.upload_schema, "tap_upload");
    }

    #[test]
    fn test_invalid_pool_size_rejected() {
        let mut config = Config::default();
        config.database.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_cap_enforced() {
        let mut config = Config::default();
        config.service.default_execution_duration = 7200;
        config.service.max_execution_duration = 3600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_text = r#"
            [server]
            port = 9090

            [service]
            max_rec = 500
            max_async_jobs = 2
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.service.max_rec, 500);
        assert_eq!(config.service.max_async_jobs, 2);
        // Untouched sections fall back to defaults
        assert_eq!(config.database.port, 5432);
    }
}
