//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP/WebSocket server port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory receiving backup artifacts
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,

    /// Destination used by restores that do not name one
    #[serde(default = "default_restore_dir")]
    pub restore_dir: PathBuf,

    /// Scratch space for uploaded archives and split download bundles
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

/// External transform binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// zstd binary. When unset the built-in zstd transform is used.
    #[serde(default)]
    pub zstd: Option<PathBuf>,

    /// age binary
    #[serde(default = "default_age")]
    pub age: PathBuf,

    /// gpg binary
    #[serde(default = "default_gpg")]
    pub gpg: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the chunks moved between stages, in bytes (default: 64KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Number of chunks buffered between two stages
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Progress snapshot cadence
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Window of the throughput moving average
    #[serde(default = "default_throughput_window_ms")]
    pub throughput_window_ms: u64,

    /// Split units running at the same time
    #[serde(default = "default_max_parallel_units")]
    pub max_parallel_units: usize,

    /// Events retained per subscriber before the oldest are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// zstd level for the built-in compressor (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Time given to an external process between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Finished jobs kept for status queries
    #[serde(default = "default_retain_finished_jobs")]
    pub retain_finished_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_backups_dir() -> PathBuf {
    home_dir().join("backups")
}

fn default_restore_dir() -> PathBuf {
    home_dir()
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("backup-engine")
}

fn default_age() -> PathBuf {
    PathBuf::from("age")
}

fn default_gpg() -> PathBuf {
    PathBuf::from("gpg")
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

fn default_channel_capacity() -> usize {
    8
}

fn default_progress_interval_ms() -> u64 {
    250 // 4 updates per second
}

fn default_throughput_window_ms() -> u64 {
    3000
}

fn default_max_parallel_units() -> usize {
    2
}

fn default_event_capacity() -> usize {
    256
}

fn default_compression_level() -> i32 {
    3
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_retain_finished_jobs() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backups_dir: default_backups_dir(),
            restore_dir: default_restore_dir(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            zstd: None,
            age: default_age(),
            gpg: default_gpg(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            progress_interval_ms: default_progress_interval_ms(),
            throughput_window_ms: default_throughput_window_ms(),
            max_parallel_units: default_max_parallel_units(),
            event_capacity: default_event_capacity(),
            compression_level: default_compression_level(),
            kill_grace_ms: default_kill_grace_ms(),
            retain_finished_jobs: default_retain_finished_jobs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `.env` and process environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        let _ = dotenvy::dotenv();

        if let Some(port) = std::env::var("BACKUP_ENGINE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(dir) = std::env::var("BACKUPS_DIR") {
            self.paths.backups_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("RESTORE_DIR") {
            self.paths.restore_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STAGING_DIR") {
            self.paths.staging_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let engine = &self.engine;
        if engine.chunk_size == 0 {
            return Err(crate::EngineError::Config("engine.chunk_size must be > 0".into()));
        }
        if engine.channel_capacity == 0 {
            return Err(crate::EngineError::Config(
                "engine.channel_capacity must be > 0".into(),
            ));
        }
        if engine.max_parallel_units == 0 {
            return Err(crate::EngineError::Config(
                "engine.max_parallel_units must be > 0".into(),
            ));
        }
        if engine.event_capacity == 0 {
            return Err(crate::EngineError::Config(
                "engine.event_capacity must be > 0".into(),
            ));
        }
        if !(1..=22).contains(&engine.compression_level) {
            return Err(crate::EngineError::Config(
                "engine.compression_level must be within 1-22".into(),
            ));
        }
        Ok(())
    }
}
