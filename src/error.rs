//! Crate-wide error type.
//!
//! Mirrors the seven abstract error kinds from the design: transient and
//! fatal transport failures, codec mismatches, recipe gate violations,
//! upstream HTTP errors, configuration errors and cancellation. Transport
//! failures that have a retry policy are recovered locally; the rest
//! surface through `DriverResult` to whichever caller can report them
//! (an MQTT reply, a recipe `result` code, or a startup log line).

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("transport transient error on {device}: {message}")]
    TransportTransient { device: String, message: String },

    #[error("transport fatal error on {device}: {message}")]
    TransportFatal { device: String, message: String },

    #[error("decode mismatch: {message}")]
    DecodeMismatch { message: String },

    #[error("recipe gate violation: {message}")]
    GateViolation { message: String },

    #[error("upstream error (http {code}): {message}")]
    UpstreamError { code: i64, message: String },

    #[error("configuration error: {message}")]
    ConfigError { message: String },

    #[error("operation cancelled: {message}")]
    Cancellation { message: String },

    #[error("timeout: {operation} after {millis}ms")]
    Timeout { operation: String, millis: u64 },
}

impl DriverError {
    pub fn transport_transient(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportTransient { device: device.into(), message: message.into() }
    }

    pub fn transport_fatal(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportFatal { device: device.into(), message: message.into() }
    }

    pub fn decode_mismatch(message: impl Into<String>) -> Self {
        Self::DecodeMismatch { message: message.into() }
    }

    pub fn gate_violation(message: impl Into<String>) -> Self {
        Self::GateViolation { message: message.into() }
    }

    pub fn upstream(code: i64, message: impl Into<String>) -> Self {
        Self::UpstreamError { code, message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError { message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout { operation: operation.into(), millis }
    }

    /// Stable short code for log correlation, matching the style of errors
    /// surfaced on MQTT replies.
    pub fn error_code(&self) -> &'static str {
        match self {
            DriverError::TransportTransient { .. } => "TRANSPORT_TRANSIENT",
            DriverError::TransportFatal { .. } => "TRANSPORT_FATAL",
            DriverError::DecodeMismatch { .. } => "DECODE_MISMATCH",
            DriverError::GateViolation { .. } => "GATE_VIOLATION",
            DriverError::UpstreamError { .. } => "UPSTREAM_ERROR",
            DriverError::ConfigError { .. } => "CONFIG_ERROR",
            DriverError::Cancellation { .. } => "CANCELLED",
            DriverError::Timeout { .. } => "TIMEOUT",
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::ConfigError { message: err.to_string() }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::DecodeMismatch { message: err.to_string() }
    }
}

impl From<config::ConfigError> for DriverError {
    fn from(err: config::ConfigError) -> Self {
        DriverError::ConfigError { message: err.to_string() }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::UpstreamError { code: 1001, message: err.to_string() }
    }
}

impl From<csv::Error> for DriverError {
    fn from(err: csv::Error) -> Self {
        DriverError::ConfigError { message: format!("catalog CSV error: {err}") }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
