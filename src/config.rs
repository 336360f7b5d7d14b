use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Poll cadence of the scheduler loop in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum number of trigger scripts running at once.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Wall-clock timeout for a single script execution.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    /// Package runner used to invoke scripts as `<runner> run <script>`.
    #[serde(default = "default_script_runner")]
    pub script_runner: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            worker_count: default_worker_count(),
            script_timeout_secs: default_script_timeout_secs(),
            script_runner: default_script_runner(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_worker_count() -> usize {
    4
}

fn default_script_timeout_secs() -> u64 {
    300
}

fn default_script_runner() -> String {
    "uv".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory holding the trigger database, PID file, and daemon log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Resolve the data directory: $TRIGGERD_DIR, else ~/.triggerd, else cwd.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TRIGGERD_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".triggerd"),
        None => PathBuf::from("."),
    }
}

impl AppConfig {
    /// Load config from a TOML file. A missing file falls back to defaults;
    /// a present-but-invalid file is an error, never silently ignored.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Load from `<data_dir>/config.toml`.
    pub fn load_default() -> anyhow::Result<Self> {
        Self::load(&default_data_dir().join("config.toml"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.state.data_dir.join("triggers.db")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state.data_dir.join("triggerd.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state.data_dir.join("daemon.log")
    }
}
