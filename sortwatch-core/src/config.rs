//! Environment-level settings: clamp threshold, history capacity, flush
//! cadence, backoff bounds. Persisted as JSON under the XDG config dir
//! ($XDG_CONFIG_HOME/sortwatch/settings.json, fallback
//! ~/.config/sortwatch/settings.json) so defaults survive restarts, with
//! SORTWATCH_* environment variables taking precedence.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

/// Any value whose absolute magnitude is below this is logged as 0.
pub const DEFAULT_SMALL_VALUE_THRESHOLD: f64 = 1e-3;

/// Recent samples kept in memory per counter.
pub const DEFAULT_HISTORY_CAPACITY: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root directory for durable per-machine record files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_clamp_threshold")]
    pub clamp_threshold: f64,
    /// Sub-interval between incremental flushes of the in-progress hour.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Per-supervisor stop deadline during shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_clamp_threshold() -> f64 {
    DEFAULT_SMALL_VALUE_THRESHOLD
}

fn default_flush_interval_secs() -> u64 {
    300
}

fn default_backoff_initial_secs() -> u64 {
    10
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_capacity: default_history_capacity(),
            clamp_threshold: default_clamp_threshold(),
            flush_interval_secs: default_flush_interval_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl CoreConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial_secs.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs.max(self.backoff_initial_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }

    /// Load persisted settings (or defaults), then apply env overrides.
    /// On first run the settings file is seeded with the defaults so
    /// operators have something to edit.
    pub fn load() -> Self {
        let mut cfg = match fs::read_to_string(settings_path()) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
            Err(_) => {
                let cfg = Self::default();
                let _ = cfg.save();
                cfg
            }
        };
        cfg.apply_env();
        cfg
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = settings_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self).expect("serialize settings");
        fs::write(path, data)
    }

    /// SORTWATCH_* environment variables win over the settings file.
    pub fn apply_env(&mut self) {
        if let Some(v) = env::var_os("SORTWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SORTWATCH_HISTORY_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.history_capacity = n;
            }
        }
        if let Ok(v) = env::var("SORTWATCH_CLAMP_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.clamp_threshold = n;
            }
        }
        if let Ok(v) = env::var("SORTWATCH_FLUSH_SECS") {
            if let Ok(n) = v.parse() {
                self.flush_interval_secs = n;
            }
        }
        if let Ok(v) = env::var("SORTWATCH_BACKOFF_INITIAL_SECS") {
            if let Ok(n) = v.parse() {
                self.backoff_initial_secs = n;
            }
        }
        if let Ok(v) = env::var("SORTWATCH_BACKOFF_MAX_SECS") {
            if let Ok(n) = v.parse() {
                self.backoff_max_secs = n;
            }
        }
        if let Ok(v) = env::var("SORTWATCH_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.shutdown_timeout_secs = n;
            }
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("sortwatch")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sortwatch")
    }
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}
