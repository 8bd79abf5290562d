//! Configuration resolution for rendq.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/rendq/settings.json)
//! 3. Project config (.rendq/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete rendq configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub queue: QueueSettings,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Render engine executable used when assembling commands from parameters.
    pub blender_bin: PathBuf,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Scheduler polling interval.
    pub poll_interval_ms: u64,
    /// Grace period between the polite termination request and the hard kill.
    pub terminate_timeout_ms: u64,
    /// Upper bound on how long a queue mutation may stay unpersisted.
    pub persist_delay_ms: u64,
    /// Number of history records kept in storage.
    pub history_limit: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            blender_bin: PathBuf::from("blender"),
            database_path: None,
            log_level: "info".to_string(),
            poll_interval_ms: 1000,
            terminate_timeout_ms: 1000,
            persist_delay_ms: 500,
            history_limit: 200,
        }
    }
}

/// User-editable queue settings.
///
/// Persisted together with the job collection and restored at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSettings {
    /// Start processing as soon as the queue is loaded or a job is added.
    pub auto_start: bool,
    /// Upper bound on simultaneously running render processes.
    pub max_concurrent: u32,
    /// Priority assigned to jobs added without one.
    pub default_priority: i32,
    /// Output path used when a job's parameters do not name one.
    pub default_output_path: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            auto_start: false,
            max_concurrent: 1,
            default_priority: 0,
            default_output_path: None,
        }
    }
}

/// Partial update for [`QueueSettings`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub auto_start: Option<bool>,
    pub max_concurrent: Option<u32>,
    pub default_priority: Option<i32>,
    /// `Some(None)` clears the default output path.
    pub default_output_path: Option<Option<String>>,
}

impl QueueSettings {
    /// Apply a partial update. `max_concurrent` is clamped to at least one.
    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(auto_start) = update.auto_start {
            self.auto_start = auto_start;
        }
        if let Some(max) = update.max_concurrent {
            self.max_concurrent = max.max(1);
        }
        if let Some(priority) = update.default_priority {
            self.default_priority = priority;
        }
        if let Some(path) = update.default_output_path {
            self.default_output_path = path;
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".rendq").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    app_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    app_dir().map(|p| p.join("queue.db"))
}

/// Per-user rendq directory (`$XDG_CONFIG_HOME/rendq` or the platform equivalent).
fn app_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("rendq"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let defaults = DaemonConfig::default();
    let daemon = overlay.daemon;

    if daemon.database_path.is_some() {
        base.daemon.database_path = daemon.database_path;
    }
    // Scalar fields only override when the overlay moved them off the default,
    // so a project file can change one knob without resetting the rest.
    if daemon.blender_bin != defaults.blender_bin {
        base.daemon.blender_bin = daemon.blender_bin;
    }
    if daemon.log_level != defaults.log_level {
        base.daemon.log_level = daemon.log_level;
    }
    if daemon.poll_interval_ms != defaults.poll_interval_ms {
        base.daemon.poll_interval_ms = daemon.poll_interval_ms;
    }
    if daemon.terminate_timeout_ms != defaults.terminate_timeout_ms {
        base.daemon.terminate_timeout_ms = daemon.terminate_timeout_ms;
    }
    if daemon.persist_delay_ms != defaults.persist_delay_ms {
        base.daemon.persist_delay_ms = daemon.persist_delay_ms;
    }
    if daemon.history_limit != defaults.history_limit {
        base.daemon.history_limit = daemon.history_limit;
    }

    base.queue = overlay.queue;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("RENDQ_BLENDER_BIN") {
        config.daemon.blender_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("RENDQ_MAX_CONCURRENT")
        && let Ok(n) = val.parse::<u32>()
    {
        config.queue.max_concurrent = n.max(1);
    }
    if let Ok(val) = std::env::var("RENDQ_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("RENDQ_POLL_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        config.daemon.poll_interval_ms = n;
    }
}
