//! Configuration structures and loading

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    pub api: ApiConfiguration,

    #[serde(default)]
    pub database: DatabaseConfiguration,

    pub vault: VaultConfiguration,

    #[serde(default)]
    pub ssh: SshConfiguration,

    #[serde(default)]
    pub monitor: MonitorConfiguration,

    #[serde(default)]
    pub alerts: AlertsConfiguration,

    #[serde(default)]
    pub notifier: NotifierConfiguration,

    #[serde(default)]
    pub rate_limit: RateLimitConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: SslConfiguration,

    /// Static bearer token checked by the auth middleware. No user/session
    /// model — out of scope per spec.md's Non-goals.
    pub bearer_token: String,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfiguration {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./fleetctl.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfiguration {
    /// Path to the 32-byte AES-256 process data key.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfiguration {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for SshConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            exec_timeout_secs: default_exec_timeout(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_idle_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfiguration {
    #[serde(default = "default_monitor_interval")]
    pub default_interval_secs: u64,

    #[serde(default = "default_monitor_floor")]
    pub min_interval_secs: u64,
}

impl Default for MonitorConfiguration {
    fn default() -> Self {
        Self {
            default_interval_secs: default_monitor_interval(),
            min_interval_secs: default_monitor_floor(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_monitor_floor() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfiguration {
    #[serde(default = "default_alert_eval_interval")]
    pub eval_interval_secs: u64,
}

impl Default for AlertsConfiguration {
    fn default() -> Self {
        Self {
            eval_interval_secs: default_alert_eval_interval(),
        }
    }
}

fn default_alert_eval_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfiguration {
    #[serde(default = "default_notifier_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_notifier_retention_days")]
    pub retention_days: i64,
}

impl Default for NotifierConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: default_notifier_max_attempts(),
            retention_days: default_notifier_retention_days(),
        }
    }
}

fn default_notifier_max_attempts() -> u32 {
    10
}

fn default_notifier_retention_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfiguration {
    #[serde(default = "default_rate_limit_requests")]
    pub requests_per_period: u32,

    #[serde(default = "default_rate_limit_period")]
    pub period_secs: u64,
}

impl Default for RateLimitConfiguration {
    fn default() -> Self {
        Self {
            requests_per_period: default_rate_limit_requests(),
            period_secs: default_rate_limit_period(),
        }
    }
}

fn default_rate_limit_requests() -> u32 {
    100
}

fn default_rate_limit_period() -> u64 {
    60
}
