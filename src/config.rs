//! Configuration management.
//!
//! Settings load from `dealflow.toml` in the data directory (every field
//! has a default, so a missing file is fine), with secrets overridable
//! through the environment. Durations are stored as integer seconds or
//! milliseconds in the file and exposed as `std::time::Duration`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ErrorSeverity;

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "dealflow.toml";

/// Environment variable overriding the inbound/outbound API key.
pub const ENV_API_KEY: &str = "DEALFLOW_API_KEY";
/// Environment variable overriding the HMAC shared secret.
pub const ENV_SHARED_SECRET: &str = "DEALFLOW_SHARED_SECRET";

/// Queue manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on items simultaneously in Processing.
    pub max_concurrent_jobs: usize,
    /// Queue-level retry bound per item.
    pub max_retry_attempts: u32,
    pub retry_backoff_multiplier: f64,
    pub max_retry_backoff_secs: u64,
    /// Max Pending age before forced failure.
    pub queue_timeout_secs: u64,
    /// Max Processing age before timeout failure.
    pub processing_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub persistence_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_history_days: i64,
    /// Queue-entry retention after a terminal status.
    pub completed_item_ttl_secs: u64,
    pub max_deal_name_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_retry_attempts: 3,
            retry_backoff_multiplier: 2.0,
            max_retry_backoff_secs: 300,
            queue_timeout_secs: 4 * 3600,
            processing_timeout_ms: 600_000,
            health_check_interval_secs: 30,
            persistence_interval_secs: 300,
            cleanup_interval_secs: 3600,
            max_history_days: 30,
            completed_item_ttl_secs: 24 * 3600,
            max_deal_name_len: 128,
        }
    }
}

impl QueueConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn completed_item_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_item_ttl_secs)
    }
}

/// Outbound webhook client and inbound server addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Base URL of the external analysis engine.
    pub base_url: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Inbound listen address.
    pub bind_host: String,
    pub bind_port: u16,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8890,
        }
    }
}

/// Authentication scheme for webhook traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    ApiKey,
    Hmac,
    Bearer,
    Basic,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ApiKey => "api_key",
            Self::Hmac => "hmac",
            Self::Bearer => "bearer",
            Self::Basic => "basic",
        }
    }
}

/// Shared-secret material for webhook traffic, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key: String,
    pub shared_secret: String,
    pub enable_hmac: bool,
    pub auth_type: AuthType,
    /// Maximum tolerated clock skew on signed timestamps.
    pub timestamp_skew_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            shared_secret: String::new(),
            enable_hmac: true,
            auth_type: AuthType::Hmac,
            timestamp_skew_secs: 300,
        }
    }
}

/// Workflow recovery service tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_retries: u32,
    pub jitter: bool,
    pub jitter_max_delay_ms: u64,
    /// Minimum severity that triggers an error notification.
    pub notification_threshold: ErrorSeverity,
    pub enable_partial_results: bool,
    /// Retention for finished executions and their error logs.
    pub error_log_retention_days: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 5 * 60 * 1000,
            backoff_factor: 2.0,
            max_retries: 5,
            jitter: true,
            jitter_max_delay_ms: 1000,
            notification_threshold: ErrorSeverity::High,
            enable_partial_results: true,
            error_log_retention_days: 7,
        }
    }
}

impl RecoveryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn jitter_max_delay(&self) -> Duration {
        Duration::from_millis(self.jitter_max_delay_ms)
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub webhook: WebhookConfig,
    pub auth: AuthConfig,
    pub recovery: RecoveryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue: QueueConfig::default(),
            webhook: WebhookConfig::default(),
            auth: AuthConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dealflow")
}

impl Settings {
    /// Load settings for a data directory, applying env overrides.
    ///
    /// A missing config file yields defaults; a malformed one is an error
    /// rather than a silent fallback.
    pub fn load(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let config_path = data_dir.join(CONFIG_FILE);

        let mut settings = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            toml::from_str(&raw)?
        } else {
            Settings::default()
        };
        settings.data_dir = data_dir;

        if let Ok(key) = std::env::var(ENV_API_KEY) {
            settings.auth.api_key = key;
        }
        if let Ok(secret) = std::env::var(ENV_SHARED_SECRET) {
            settings.auth.shared_secret = secret;
        }
        Ok(settings)
    }

    /// Write the current settings to the data directory.
    pub fn write_to(&self, data_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(data_dir)?;
        let raw = toml::to_string_pretty(self)?;
        fs::write(data_dir.join(CONFIG_FILE), raw)?;
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn deals_dir(&self) -> PathBuf {
        self.data_dir.join("deals")
    }

    pub fn deal_folder(&self, deal_name: &str) -> PathBuf {
        self.deals_dir().join(deal_name)
    }
}
