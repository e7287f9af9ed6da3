// Server settings
// Loaded from ~/.config/gridserve/config.toml (or an explicit path)

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ConfigError {
    /// File read error.
    Io(String),
    /// TOML parse / deserialization error.
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "config read error: {}", msg),
            Self::Parse(msg) => write!(f, "config parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Listener
    pub listen_host: String,
    pub listen_port: u16,

    // Directories
    pub documents_dir: PathBuf,
    pub save_dir: PathBuf,

    // Directory monitor
    /// Seconds between document-directory scans. Also sets the
    /// handshake lookup retry budget (one retry per second, plus one).
    pub poll_interval_secs: u64,
    /// Reload a document when its on-disk bytes change.
    pub reload_on_change: bool,

    // Sessions
    /// Idle-read timeout for client sockets, in seconds.
    pub idle_timeout_secs: u64,
    /// Upper bound on waiting for a resource's lock at bind time.
    pub bind_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Listener
            listen_host: "127.0.0.1".to_string(),
            listen_port: 5555,
            // Directories
            documents_dir: PathBuf::from("./spreadsheets"),
            save_dir: PathBuf::from("./saved_spreadsheets"),
            // Monitor
            poll_interval_secs: 60,
            reload_on_change: true,
            // Sessions
            idle_timeout_secs: 10,
            bind_timeout_secs: 60,
        }
    }
}

impl Settings {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from an explicit path, or from the default location if it
    /// exists, or fall back to defaults.
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gridserve").join("config.toml"))
}
