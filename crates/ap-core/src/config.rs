//! Configuration loading.
//!
//! Reads `$AP_HOME/config.toml`; a missing file yields defaults. A handful of
//! environment variables override file values so the CLI can be pointed at a
//! different backend without editing the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::FreshTokenOptions;

/// Env var overriding `base_url`.
pub const BASE_URL_ENV: &str = "AP_BASE_URL";
/// Env var overriding `device_name`.
pub const DEVICE_NAME_ENV: &str = "AP_DEVICE_NAME";

pub mod paths {
    //! Path resolution for AP configuration and data.
    //!
    //! AP_HOME resolution order:
    //! 1. AP_HOME environment variable (if set)
    //! 2. ~/.config/ap (default)

    use std::path::PathBuf;

    /// Returns the AP home directory.
    pub fn ap_home() -> PathBuf {
        if let Ok(home) = std::env::var("AP_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".ap"),
            |h| h.join(".config").join("ap"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        ap_home().join("config.toml")
    }

    /// Durable slot for the device refresh token.
    pub fn device_token_path() -> PathBuf {
        ap_home().join("device.json")
    }

    /// Directory holding cached chat summaries and details.
    pub fn cache_dir() -> PathBuf {
        ap_home().join("cache")
    }
}

/// Token refresh tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Background refresh is skipped while the token outlives this window.
    pub min_validity_ms: u64,
    /// Random extra window added to `min_validity_ms` per check.
    pub jitter_ms: u64,
}

impl AuthConfig {
    /// Soft pre-refresh options for [`crate::ApClient::with_prefresh`].
    pub fn fresh_token_options(&self) -> FreshTokenOptions {
        FreshTokenOptions {
            min_validity_ms: self.min_validity_ms,
            jitter_ms: self.jitter_ms,
            ..FreshTokenOptions::default()
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_validity_ms: 120_000,
            jitter_ms: 30_000,
        }
    }
}

/// Chat runtime timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Streaming flag flips off after this much stream silence.
    pub stream_idle_timeout_ms: u64,
    /// Finished reasoning blocks collapse after this delay.
    pub reasoning_collapse_delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_idle_timeout_ms: 15_000,
            reasoning_collapse_delay_ms: 1_500,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for daily log files. Logs go to stderr when unset.
    pub dir: Option<String>,
    /// `EnvFilter` directive used when `AP_LOG` is not set.
    pub filter: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL, e.g. `https://ap.example.com`
    pub base_url: Option<String>,
    /// Device name reported on login
    pub device_name: String,
    /// Agent key sent with each query
    pub agent_key: String,
    /// Timeout for non-streaming requests
    pub request_timeout_secs: u64,
    pub auth: AuthConfig,
    pub chat: ChatConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            device_name: Self::DEFAULT_DEVICE_NAME.to_string(),
            agent_key: Self::DEFAULT_AGENT_KEY.to_string(),
            request_timeout_secs: 30,
            auth: AuthConfig::default(),
            chat: ChatConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub const DEFAULT_DEVICE_NAME: &'static str = "ap-cli";
    pub const DEFAULT_AGENT_KEY: &'static str = "default";

    /// Loads configuration from the default path and applies env overrides.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        config.apply_env();
        Ok(config)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.base_url = Some(trimmed.to_string());
            }
        }
        if let Ok(name) = std::env::var(DEVICE_NAME_ENV) {
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                self.device_name = trimmed.to_string();
            }
        }
    }

    /// Returns the configured base URL, normalized.
    ///
    /// # Errors
    /// Returns an error if no base URL is configured or it is not a valid URL.
    pub fn require_base_url(&self) -> Result<String> {
        let raw = self.base_url.as_deref().unwrap_or_default();
        if raw.trim().is_empty() {
            anyhow::bail!(
                "No backend configured. Set {BASE_URL_ENV} or base_url in {}",
                paths::config_path().display()
            );
        }
        normalize_base_url(raw)
    }

    /// Serializes the effective settings, env overrides included.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Writes the default config template to `path`.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

/// Trims whitespace and trailing slashes, and validates the URL.
///
/// # Errors
/// Returns an error if the URL does not parse or is not http(s).
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed =
        url::Url::parse(trimmed).with_context(|| format!("Invalid base URL: {trimmed}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported base URL scheme '{}': {trimmed}", parsed.scheme());
    }
    Ok(trimmed.to_string())
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# AP client configuration

# Backend base URL (overridden by AP_BASE_URL)
# base_url = "https://ap.example.com"

# Device name reported at login (overridden by AP_DEVICE_NAME)
device_name = "ap-cli"

# Agent key used for new queries
agent_key = "default"

request_timeout_secs = 30

[auth]
# Skip background refresh while the token is valid for longer than this
min_validity_ms = 120000
jitter_ms = 30000

[chat]
stream_idle_timeout_ms = 15000
reasoning_collapse_delay_ms = 1500

[log]
# dir = "/tmp/ap-logs"
# filter = "ap_core=debug,ap_chat=debug"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.device_name, Config::DEFAULT_DEVICE_NAME);
        assert_eq!(config.auth.min_validity_ms, 120_000);
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "base_url = \"http://localhost:8080/\"\n[chat]\nstream_idle_timeout_ms = 500\n",
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chat.stream_idle_timeout_ms, 500);
        assert_eq!(config.chat.reasoning_collapse_delay_ms, 1_500);
        assert_eq!(config.require_base_url().unwrap(), "http://localhost:8080");
    }

    #[test]
    fn test_effective_toml_reloads_to_same_settings() {
        let mut config = Config {
            base_url: Some("https://ap.example.com".to_string()),
            ..Config::default()
        };
        config.auth.jitter_ms = 5;
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[auth]"));

        let reloaded: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(reloaded.base_url.as_deref(), Some("https://ap.example.com"));
        assert_eq!(reloaded.auth.jitter_ms, 5);
        assert_eq!(reloaded.chat.stream_idle_timeout_ms, 15_000);
    }

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.agent_key, "default");
        assert_eq!(config.auth.jitter_ms, 30_000);
    }

    #[test]
    fn test_auth_section_feeds_soft_prefresh() {
        let config: Config =
            toml::from_str("[auth]\nmin_validity_ms = 5000\njitter_ms = 0\n").unwrap();
        let opts = config.auth.fresh_token_options();
        assert_eq!(opts.min_validity_ms, 5_000);
        assert_eq!(opts.jitter_ms, 0);
        assert!(!opts.force_refresh);
        assert_eq!(opts.failure_mode, crate::auth::FailureMode::Soft);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::init(&path).unwrap();
        assert!(Config::init(&path).is_err());
    }

    #[test]
    fn test_normalize_base_url_rejects_other_schemes() {
        assert!(normalize_base_url("ftp://example.com").is_err());
        assert_eq!(
            normalize_base_url("  https://a.example.com//  ").unwrap(),
            "https://a.example.com"
        );
    }
}
