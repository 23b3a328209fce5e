//! Error handling for the rollup pipeline.
//!
//! This module provides:
//! - A single crate error type with machine-readable codes and error chaining
//! - Retry classification used by the job queue (transient vs. deterministic)
//! - Severity-driven logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use rollup_core::error::{ErrorCode, Result, RollupError};
//!
//! fn require_rating(raw: Option<f64>) -> Result<f64> {
//!     raw.ok_or_else(|| RollupError::invalid_payload("missing rating"))
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for rollup operations.
pub type Result<T> = std::result::Result<T, RollupError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// Codes are stable; they appear in logs, metrics labels and dead-lettered jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Aggregate Errors (1000-1099)
    InvalidPayload,
    PreconditionViolated,
    CasConflict,

    // Queue Errors (1100-1199)
    QueueError,
    JobNotFound,
    HandlerTimeout,

    // Broker Errors (1200-1299)
    BrokerError,
    BrokerConnectionFailed,
    MalformedMessage,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,

    // Cache Errors (2100-2199)
    CacheError,
    CacheConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidPayload => 1000,
            Self::PreconditionViolated => 1001,
            Self::CasConflict => 1002,

            Self::QueueError => 1100,
            Self::JobNotFound => 1101,
            Self::HandlerTimeout => 1102,

            Self::BrokerError => 1200,
            Self::BrokerConnectionFailed => 1201,
            Self::MalformedMessage => 1202,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2003,

            Self::CacheError => 2100,
            Self::CacheConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is transient and worth retrying.
    ///
    /// Everything the queue's retry policy should absorb is listed here;
    /// anything else fails a job deterministically.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CasConflict
                | Self::QueueError
                | Self::HandlerTimeout
                | Self::BrokerError
                | Self::BrokerConnectionFailed
                | Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::CacheError
                | Self::CacheConnectionFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "aggregate",
            1100..=1199 => "queue",
            1200..=1299 => "broker",
            2000..=2099 => "database",
            2100..=2199 => "cache",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input from upstream producers
    Low,
    /// Operational noise (contention, timeouts)
    Medium,
    /// System errors (query failures, corrupt data)
    High,
    /// Connectivity loss and bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidPayload
            | ErrorCode::RecordNotFound
            | ErrorCode::JobNotFound => Self::Low,

            ErrorCode::PreconditionViolated
            | ErrorCode::MalformedMessage
            | ErrorCode::CasConflict
            | ErrorCode::HandlerTimeout => Self::Medium,

            ErrorCode::QueueError
            | ErrorCode::BrokerError
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::CacheError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::BrokerConnectionFailed
            | ErrorCode::DatabaseConnectionFailed
            | ErrorCode::CacheConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (aggregate entity, job, stream entry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the rollup pipeline.
///
/// Carries a code (which decides retry behaviour), a short message, an optional
/// internal message from the underlying client, and the source error.
#[derive(Error, Debug)]
pub struct RollupError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short, stable message
    message: Cow<'static, str>,

    /// Detailed message from the failing client (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RollupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RollupError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a short and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create an invalid-payload error (deterministic, never retried).
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InvalidPayload, "Job payload is invalid", message)
    }

    /// An update whose precondition does not hold against the cached aggregate.
    ///
    /// The job still completes; the error is built for logging and metrics.
    pub fn precondition_violated(entity_id: impl fmt::Display, reason: &str) -> Self {
        Self::with_internal(
            ErrorCode::PreconditionViolated,
            "Event cannot apply to the cached aggregate",
            reason.to_string(),
        )
        .with_details(ErrorDetails::new().with_entity("entity", entity_id.to_string()))
    }

    /// A broker message whose body is not JSON. It is committed and skipped.
    pub fn malformed_message(message_id: &str, cause: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::MalformedMessage,
            "Broker message is not JSON",
            cause.to_string(),
        )
        .with_details(ErrorDetails::new().with_entity("message", message_id))
        .with_source(cause)
    }

    /// Create a CAS conflict error after the optimistic retries ran out.
    pub fn cas_conflict(entity_id: impl fmt::Display, attempts: u32) -> Self {
        Self::new(
            ErrorCode::CasConflict,
            format!("Aggregate for entity {} changed concurrently {} times", entity_id, attempts),
        )
        .with_details(ErrorDetails::new().with_entity("entity", entity_id.to_string()))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            message,
        )
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = std::mem::take(&mut self.details).with_context(key, value);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "rollup_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for RollupError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for RollupError {
    fn from(error: redis::RedisError) -> Self {
        let (code, msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::CacheError, "Redis operation timed out")
        } else {
            (ErrorCode::CacheError, "A Redis error occurred")
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RollupError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for RollupError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
