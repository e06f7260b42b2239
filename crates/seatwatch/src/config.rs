//! Application configuration, loaded from a JSON file with environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::harvest::HarvesterConfig;
use crate::notify::{DispatchConfig, TelegramConfig};
use crate::types::SubscriberId;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SEATWATCH_CONFIG";
/// Environment variable that overrides `telegram.bot_token`.
pub const BOT_TOKEN_ENV: &str = "BOT_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub harvester: HarvesterConfig,
    pub scrape: ScrapeConfig,
    pub notify: NotifyConfig,
    pub telegram: TelegramConfig,
    pub server: Option<ServerConfig>,
}

/// Both databases must survive restarts; they may live in separate files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub offerings_db: PathBuf,
    pub subscriptions_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            offerings_db: PathBuf::from("classes.db"),
            subscriptions_db: PathBuf::from("chats.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Delay between the end of one cycle and the start of the next.
    pub interval_secs: u64,
    /// Consecutive failed cycles before the operator is alerted.
    pub failure_alert_threshold: u32,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            failure_alert_threshold: 5,
        }
    }
}

impl ScrapeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub remove_after_notify: bool,
    pub max_concurrent_sends: usize,
    /// Chat that receives operator alerts about persistent harvest failures.
    pub operator_chat_id: Option<SubscriberId>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        let dispatch = DispatchConfig::default();
        Self {
            remove_after_notify: dispatch.remove_after_notify,
            max_concurrent_sends: dispatch.max_concurrent_sends,
            operator_chat_id: None,
        }
    }
}

impl NotifyConfig {
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            remove_after_notify: self.remove_after_notify,
            max_concurrent_sends: self.max_concurrent_sends,
        }
    }
}

/// Read-only HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Loads the config from `path`, or from `$SEATWATCH_CONFIG`, or falls
    /// back to defaults when neither is set. `$BOT_TOKEN` always wins over the
    /// file's token.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };

        if let Ok(token) = env::var(BOT_TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.telegram.bot_token = token.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON config file without applying overrides or validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scrape.interval_secs == 0 {
            return Err(Error::config("scrape.interval_secs must be greater than 0"));
        }
        if self.notify.max_concurrent_sends == 0 {
            return Err(Error::config("notify.max_concurrent_sends must be greater than 0"));
        }
        if self.telegram.bot_token.trim().is_empty() {
            return Err(Error::config(format!(
                "telegram.bot_token is empty (set it in the config file or ${BOT_TOKEN_ENV})"
            )));
        }
        if self.harvester.departments.is_empty() {
            return Err(Error::config("harvester.departments must list at least one department"));
        }
        Ok(())
    }
}
