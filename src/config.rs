use config::{Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker tasks per user (§4.6).
    pub pool_size: usize,
    /// Background sync timer period, in seconds (§4.7).
    pub sync_interval_secs: u64,
    /// Global backoff duration after a RemoteOverloaded signal, in seconds (§4.3/§8).
    pub backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { pool_size: 10, sync_interval_secs: 60, backoff_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let default_config_path = "config/default.toml";
        let path_to_use = config_path.unwrap_or(default_config_path);

        let builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("storage.path", "mailbridge.db")?
            .set_default("worker.pool_size", 10)?
            .set_default("worker.sync_interval_secs", 60)?
            .set_default("worker.backoff_secs", 30)?
            .add_source(File::with_name(path_to_use).required(false))
            // e.g. APP__REMOTE__HOST overrides remote.host
            .add_source(Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load or parse configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}
