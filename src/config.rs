//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend URL, which session storage to use, the last email used to sign
//! in, and the session/guard tuning knobs.
//!
//! Configuration is stored at `~/.config/eventdesk/config.json`. Values can
//! be overridden from the environment (or a `.env` file):
//! `EVENTDESK_API_URL`, `EVENTDESK_STORAGE`, `EVENTDESK_EMAIL`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::guard::DEFAULT_LOGIN_PATH;
use crate::auth::{HydrationPolicy, StorageKind};

/// Application name used for config/data directory paths
const APP_NAME: &str = "eventdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured
const DEFAULT_API_URL: &str = "http://localhost:3333";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const API_URL_ENV: &str = "EVENTDESK_API_URL";
const STORAGE_ENV: &str = "EVENTDESK_STORAGE";
const EMAIL_ENV: &str = "EVENTDESK_EMAIL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageKind,
    pub last_email: Option<String>,
    pub request_timeout_secs: u64,
    pub hydration: HydrationPolicy,
    pub login_path: String,
    /// Views reachable without signing in, besides the login page
    pub public_paths: Vec<String>,
    /// Also write logs to `<data dir>/logs`
    pub log_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            storage: StorageKind::default(),
            last_email: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            hydration: HydrationPolicy::default(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            public_paths: Vec::new(),
            log_file: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `EVENTDESK_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(kind) = lookup(STORAGE_ENV) {
            match kind.parse() {
                Ok(kind) => self.storage = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", STORAGE_ENV),
            }
        }
        if let Some(email) = lookup(EMAIL_ENV).filter(|v| !v.trim().is_empty()) {
            self.last_email = Some(email.trim().to_string());
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Directory for `FileStorage` session entries
    pub fn session_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("session"))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }
}
