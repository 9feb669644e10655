// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem. Each subsystem has its own enum with
// helper constructors; all of them convert into `FleetError`.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

use crate::types::InstId;

// ----------------------------------------------------------------------------
// Core Error
// ----------------------------------------------------------------------------

/// The main error type. All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            FleetError::Config(_) => false,
            FleetError::Transport(e) => e.is_recoverable(),
            FleetError::Message(_) => true,
            FleetError::Metric(_) => true,
            FleetError::Request(_) => true,
            FleetError::Io(_) => true,
            FleetError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            FleetError::Config(_) => "config",
            FleetError::Transport(_) => "transport",
            FleetError::Message(_) => "message",
            FleetError::Metric(_) => "metric",
            FleetError::Request(_) => "request",
            FleetError::Io(_) => "io",
            FleetError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors from the publish/subscribe transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid routing key '{key}'")]
    InvalidKey { key: String },
}

impl TransportError {
    /// A bad key stays bad on retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::InvalidKey { .. } => false,
        }
    }

    pub fn invalid_key(key: impl Into<String>) -> Self {
        TransportError::InvalidKey { key: key.into() }
    }
}

// ----------------------------------------------------------------------------
// Message Errors
// ----------------------------------------------------------------------------

/// Errors raised while validating messages at the transport boundary
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to decode message: {message}")]
    Decode { message: String },

    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

impl MessageError {
    pub fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        MessageError::Malformed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(e: serde_json::Error) -> Self {
        MessageError::Decode {
            message: e.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Metric Errors
// ----------------------------------------------------------------------------

/// Errors from the metric computation model and agent-side metrics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("unknown metric {module}/{stat}")]
    UnknownMetric { module: String, stat: String },

    #[error("unknown field '{field}' for {module}/{stat}")]
    UnknownField {
        field: String,
        module: String,
        stat: String,
    },

    #[error("at most one numeric decomposition is supported (got {fields:?})")]
    MultipleNumeric { fields: Vec<String> },

    #[error("field '{field}' appears more than once in the decomposition")]
    DuplicateDecomposition { field: String },

    #[error("'{op}' predicate needs at least one child")]
    EmptyCombinator { op: &'static str },

    #[error("numeric field '{field}' has no bucketizer")]
    MissingBucketizer { field: String },

    #[error("numeric field '{field}' has an unusable bucketizer")]
    InvalidBucketizer { field: String },

    #[error("metric {module}/{stat} is already registered")]
    AlreadyRegistered { module: String, stat: String },

    #[error("module '{module}' is not registered")]
    UnknownModule { module: String },

    #[error("metric is not instrumented")]
    NotInstrumented,

    #[error("sample source failed: {message}")]
    Source { message: String },

    #[error("cannot merge {left} value with {right} value")]
    ShapeMismatch {
        left: &'static str,
        right: &'static str,
    },
}

impl MetricError {
    pub fn unknown_field(
        field: impl Into<String>,
        module: impl Into<String>,
        stat: impl Into<String>,
    ) -> Self {
        MetricError::UnknownField {
            field: field.into(),
            module: module.into(),
            stat: stat.into(),
        }
    }

    pub fn source(message: impl Into<String>) -> Self {
        MetricError::Source {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Request Errors
// ----------------------------------------------------------------------------

/// HTTP-style status codes carried back to the request layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Created,
    BadRequest,
    NotFound,
    Conflict,
    ServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::Conflict => 409,
            StatusCode::ServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }
}

/// Errors reported to the request layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("invalid instrumentation: {message}")]
    Validation { message: String },

    #[error("no aggregators available")]
    NoAggregators,

    #[error("instrumentation {id} not found")]
    NotFound { id: InstId },

    #[error("error: {message}")]
    EnableFailed { message: String },

    #[error("instrumentation {id} deleted before enable completed")]
    Cancelled { id: InstId },

    #[error("coordinator is not running")]
    Unavailable,
}

impl RequestError {
    pub fn validation(message: impl Into<String>) -> Self {
        RequestError::Validation {
            message: message.into(),
        }
    }

    pub fn enable_failed(message: impl Into<String>) -> Self {
        RequestError::EnableFailed {
            message: message.into(),
        }
    }

    /// Status code the request layer answers with
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Validation { .. } => StatusCode::BadRequest,
            RequestError::NoAggregators => StatusCode::ServerError,
            RequestError::NotFound { .. } => StatusCode::NotFound,
            RequestError::EnableFailed { .. } => StatusCode::ServerError,
            RequestError::Cancelled { .. } => StatusCode::Conflict,
            RequestError::Unavailable => StatusCode::ServiceUnavailable,
        }
    }
}

impl From<MetricError> for RequestError {
    fn from(e: MetricError) -> Self {
        RequestError::validation(e.to_string())
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type FleetResult<T> = Result<T, FleetError>;

pub type TransportResult<T> = Result<T, TransportError>;

pub type MessageResult<T> = Result<T, MessageError>;

pub type MetricResult<T> = Result<T, MetricError>;

pub type RequestResult<T> = Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RequestError::validation("missing module") => 400)]
    #[test_case(RequestError::NoAggregators => 500)]
    #[test_case(RequestError::NotFound { id: InstId::new(7) } => 404)]
    #[test_case(RequestError::enable_failed("failed to enable aggregator") => 500)]
    #[test_case(RequestError::Cancelled { id: InstId::new(3) } => 409)]
    #[test_case(RequestError::Unavailable => 503)]
    fn test_request_error_status(err: RequestError) -> u16 {
        err.status().as_u16()
    }

    #[test]
    fn test_error_categories() {
        let err: FleetError = ConfigError::missing_field("coordinator.key_base").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err: FleetError = TransportError::invalid_key("").into();
        assert_eq!(err.category(), "transport");
        assert!(!err.is_recoverable());

        let err: FleetError = MetricError::NotInstrumented.into();
        assert_eq!(err.category(), "metric");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_metric_error_becomes_validation() {
        let err: RequestError = MetricError::unknown_field("zone", "cpu", "usage").into();
        assert_eq!(err.status(), StatusCode::BadRequest);
        assert!(err.to_string().contains("unknown field 'zone'"));
    }
}
