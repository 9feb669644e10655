// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (FLEETSTAT_SECTION__FIELD)
// - Validation
// - Sensible defaults
// ============================================================================

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::{
    DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_KEY_BASE, DEFAULT_REPORT_INTERVAL_MS,
    DEFAULT_REQUEST_QUEUE, DEFAULT_RETAIN_SAMPLES, DEFAULT_SWEEP_INTERVAL_MS,
    MIN_ACK_TIMEOUT_SECS, MIN_REPORT_INTERVAL_MS,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for every fleetstat component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Instrumenter and aggregator settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("FLEETSTAT_").split("__")),
        )
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Env::prefixed("FLEETSTAT_").split("__")))
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.key_base.trim().is_empty() {
            return Err(ConfigError::missing_field("coordinator.key_base"));
        }

        if self.coordinator.key_base.contains(char::is_whitespace) {
            return Err(ConfigError::invalid_value(
                "coordinator.key_base",
                "Routing key base cannot contain whitespace",
            ));
        }

        if self.coordinator.ack_timeout < Duration::from_secs(MIN_ACK_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_value(
                "coordinator.ack_timeout",
                format!("Ack timeout must be at least {}s", MIN_ACK_TIMEOUT_SECS),
            ));
        }

        if self.coordinator.sweep_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "coordinator.sweep_interval",
                "Sweep interval must be positive",
            ));
        }

        if self.coordinator.request_queue == 0 {
            return Err(ConfigError::invalid_value(
                "coordinator.request_queue",
                "Request queue capacity must be positive",
            ));
        }

        if self.agent.report_interval < Duration::from_millis(MIN_REPORT_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "agent.report_interval",
                format!(
                    "Report interval must be at least {}ms",
                    MIN_REPORT_INTERVAL_MS
                ),
            ));
        }

        if self.agent.retain_samples == 0 {
            return Err(ConfigError::invalid_value(
                "agent.retain_samples",
                "Aggregators must retain at least one sample",
            ));
        }

        self.logging.format.parse::<LogFormat>()?;

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Coordinator Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Hostname stamped on outgoing envelopes (auto-detected if empty)
    #[serde(default)]
    pub hostname: Option<String>,

    /// Prefix of every routing key
    #[serde(default = "default_key_base")]
    pub key_base: String,

    /// How long a creation attempt may wait for acks
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// How often expired creation attempts are swept
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Capacity of the request queue
    #[serde(default = "default_request_queue")]
    pub request_queue: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            key_base: default_key_base(),
            ack_timeout: default_ack_timeout(),
            sweep_interval: default_sweep_interval(),
            request_queue: default_request_queue(),
        }
    }
}

impl CoordinatorConfig {
    /// Configured hostname, falling back to the environment
    pub fn effective_hostname(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".into())
    }
}

fn default_key_base() -> String {
    DEFAULT_KEY_BASE.into()
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS)
}

fn default_sweep_interval() -> Duration {
    Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)
}

fn default_request_queue() -> usize {
    DEFAULT_REQUEST_QUEUE
}

// ----------------------------------------------------------------------------
// Agent Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// How often instrumenters publish values
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Per-second samples an aggregator keeps per instrumentation
    #[serde(default = "default_retain_samples")]
    pub retain_samples: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
            retain_samples: default_retain_samples(),
        }
    }
}

fn default_report_interval() -> Duration {
    Duration::from_millis(DEFAULT_REPORT_INTERVAL_MS)
}

fn default_retain_samples() -> usize {
    DEFAULT_RETAIN_SAMPLES
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}
