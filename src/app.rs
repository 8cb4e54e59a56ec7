use crate::api::models::Session;
use crate::error::{ChatError, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PAWTALK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    pub base_url: String,
    pub api_key: String,
    pub email: String,
    pub request_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub join_timeout_secs: u64,
    pub retry: RetrySettings,
    pub session: Option<Session>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            email: String::new(),
            request_timeout_secs: 15,
            heartbeat_secs: 25,
            join_timeout_secs: 10,
            retry: RetrySettings::default(),
            session: None,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `$PAWTALK_CONFIG` when set, otherwise `<config dir>/pawtalk.toml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("pawtalk.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::default_path()
            .ok_or_else(|| ChatError::Config("no config directory".into()))?;
        Self::load_from(&path)
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str::<AppState>(&text)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| ChatError::Config("no config directory".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, toml)?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.api_key.is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}
