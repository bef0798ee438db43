//! Application settings and configuration management

use crate::engine::load_balancer::LoadBalanceStrategy;
use crate::error::{GatewayError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    /// When false, per-node progress chatter is collapsed into a single
    /// "in progress" notification per job.
    #[serde(default = "default_true")]
    pub show_node_updates: bool,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-instance configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Idle timeout in seconds; zero or negative disables the timeout.
    #[serde(default = "default_instance_timeout")]
    pub timeout_secs: i64,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Instance authentication configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Path to a PEM CA bundle trusted in addition to the system roots.
    #[serde(default)]
    pub ssl_cert: Option<String>,
}

/// Load balancer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategy::default(),
        }
    }
}

/// Retry policy for transient generation-request failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_instance_timeout() -> i64 {
    900
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("configuration")
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(
                File::with_name(path.as_ref().to_str().unwrap_or("configuration"))
                    .required(false),
            )
            // Override with environment variables (prefixed with FORGE_)
            .add_source(
                Environment::with_prefix("FORGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(GatewayError::Config(config::ConfigError::Message(
                "At least one engine instance must be configured".to_string(),
            )));
        }

        for instance in &self.instances {
            if instance.url.is_empty() {
                return Err(GatewayError::Config(config::ConfigError::Message(
                    "Instance url cannot be empty".to_string(),
                )));
            }
            if instance.weight == 0 {
                return Err(GatewayError::Config(config::ConfigError::Message(
                    format!("Instance '{}' must have weight >= 1", instance.url),
                )));
            }
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instances: vec![],
            load_balancer: LoadBalancerConfig::default(),
            show_node_updates: true,
            sweep_interval_secs: default_sweep_interval(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
