use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// User agent presented by every session's browser instead of the headless default.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// User ids or usernames allowed to issue commands. Empty means anyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8080
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// Timing of the polling loop and of the page-settling steps inside one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_post_load_pause_ms")]
    pub post_load_pause_ms: u64,
    #[serde(default = "default_settle_pause_ms")]
    pub settle_pause_ms: u64,
    #[serde(default = "default_scroll_step_px")]
    pub scroll_step_px: u32,
    #[serde(default = "default_scroll_interval_ms")]
    pub scroll_interval_ms: u64,
    /// Upper bound on scroll steps for pages that keep growing forever.
    #[serde(default = "default_max_scroll_steps")]
    pub max_scroll_steps: u32,
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_navigation_timeout_ms() -> u64 {
    30000
}

fn default_post_load_pause_ms() -> u64 {
    1000
}

fn default_settle_pause_ms() -> u64 {
    1000
}

fn default_scroll_step_px() -> u32 {
    500
}

fn default_scroll_interval_ms() -> u64 {
    100
}

fn default_max_scroll_steps() -> u32 {
    200
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            post_load_pause_ms: default_post_load_pause_ms(),
            settle_pause_ms: default_settle_pause_ms(),
            scroll_step_px: default_scroll_step_px(),
            scroll_interval_ms: default_scroll_interval_ms(),
            max_scroll_steps: default_max_scroll_steps(),
        }
    }
}

impl WatchConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Explicit Chrome/Chromium binary. Searched on PATH when unset.
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_headless() -> bool {
    true
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: None,
            headless: default_headless(),
            launch_timeout_secs: default_launch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from disk, apply environment overrides, and validate.
    pub fn resolve(paths: &Paths) -> Result<Self> {
        let mut config = Self::load_or_default(paths)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values supplied through the environment.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("PAGEWATCH_RETRY_INTERVAL_MS") {
            self.watch.retry_interval_ms = parse_env("PAGEWATCH_RETRY_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("PAGEWATCH_NAVIGATION_TIMEOUT_MS") {
            self.watch.navigation_timeout_ms = parse_env("PAGEWATCH_NAVIGATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PORT") {
            self.gateway.port = parse_env("PORT", &v)?;
        }
        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.token = token;
            self.channels.telegram.enabled = true;
        }
        if let Some(binary) = get("PAGEWATCH_BROWSER") {
            self.browser.binary = Some(binary);
        }
        debug!(
            retry_interval_ms = self.watch.retry_interval_ms,
            navigation_timeout_ms = self.watch.navigation_timeout_ms,
            port = self.gateway.port,
            "Configuration resolved"
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch.retry_interval_ms == 0 {
            return Err(Error::Config("watch.retryIntervalMs must be greater than 0".into()));
        }
        if self.watch.navigation_timeout_ms == 0 {
            return Err(Error::Config(
                "watch.navigationTimeoutMs must be greater than 0".into(),
            ));
        }
        if self.watch.scroll_step_px == 0 {
            return Err(Error::Config("watch.scrollStepPx must be greater than 0".into()));
        }
        if self.channels.telegram.enabled && self.channels.telegram.token.trim().is_empty() {
            return Err(Error::Config(
                "channels.telegram is enabled but no token is set".into(),
            ));
        }
        Ok(())
    }

    /// Copy suitable for printing: secrets replaced.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.channels.telegram.token.is_empty() {
            copy.channels.telegram.token = "***".to_string();
        }
        copy
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, value)))
}
