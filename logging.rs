// ============================================================================
// LOGGING & TRACING
// ============================================================================
// One global subscriber: an `EnvFilter` (RUST_LOG wins over the configured
// level) and a single fmt layer in the configured format. Per-message
// transport events stay at debug/trace, so the bus is capped one notch
// below the base level unless tracing everything.
// ============================================================================

use std::str::FromStr;

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ConfigError, FleetError, FleetResult};

const TRANSPORT_TARGET: &str = "fleetstat::transport";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown log format '{}' (pretty, compact, json)", other),
            )),
        }
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Filter directives for a configured level, e.g. `debug,fleetstat::transport=info`
pub fn directives(level: &str) -> String {
    let base = parse_level(level);
    let transport = match base {
        LevelFilter::TRACE => LevelFilter::TRACE,
        LevelFilter::DEBUG => LevelFilter::INFO,
        other => other,
    };
    if transport == base {
        base.to_string().to_lowercase()
    } else {
        format!(
            "{},{}={}",
            base.to_string().to_lowercase(),
            TRANSPORT_TARGET,
            transport.to_string().to_lowercase()
        )
    }
}

fn build_filter(config: &LoggingConfig) -> FleetResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directives(&config.level))
        .map_err(|e| FleetError::Internal(format!("Bad log filter: {}", e)))
}

fn build_layer(
    config: &LoggingConfig,
    format: LogFormat,
) -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let base = fmt::layer()
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location);
    match format {
        LogFormat::Json => base.json().with_thread_names(true).boxed(),
        LogFormat::Compact => base.compact().with_ansi(config.colors).boxed(),
        LogFormat::Pretty => base
            .pretty()
            .with_ansi(config.colors)
            .with_thread_names(true)
            .boxed(),
    }
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LoggingConfig) -> FleetResult<()> {
    let format: LogFormat = config.format.parse()?;
    let subscriber = tracing_subscriber::registry()
        .with(build_layer(config, format))
        .with(build_filter(config)?);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| FleetError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "fleetstat::init",
        level = %config.level,
        format = ?format,
        "Logging initialized"
    );
    Ok(())
}
