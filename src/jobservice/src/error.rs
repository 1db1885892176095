//! Error handling for the job service.
//!
//! This module provides:
//! - A single error type with machine-readable codes and error chaining
//! - User-facing messages kept apart from detailed internal messages
//! - Typed predicates for the soft errors the lifecycle depends on
//!   (status mismatch, no elements, not found, conflict)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobservice_core::error::{JobServiceError, Result, ErrorContext};
//!
//! fn load(raw: &str) -> Result<Stats> {
//!     serde_json::from_str(raw).context("Failed to decode job stats")
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

/// A specialized Result type for job service operations.
pub type Result<T> = std::result::Result<T, JobServiceError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation Errors (1000-1099)
    BadRequest,
    InvalidParameters,
    MissingRequiredField,
    InvalidCronSpec,

    // Lookup Errors (1100-1199)
    ObjectNotFound,
    UnknownJob,

    // Conflict Errors (1200-1299)
    UniqueConflict,
    AlreadyRegistered,

    // Lifecycle Errors (1300-1399)
    StatusMismatch,
    InvalidStatus,

    // Queue Errors (1400-1499)
    NoElements,
    LockUnavailable,

    // Redis Errors (2000-2099)
    RedisError,
    RedisConnectionFailed,
    ScriptFailed,

    // Serialization Errors (2100-2199)
    SerializationError,
    DeserializationError,

    // Hook / HTTP Errors (3000-3099)
    HookSendFailed,
    HookTimeout,
    NetworkError,

    // Handler Errors (3100-3199)
    HandlerFailed,
    HandlerPanicked,

    // Migration Errors (4000-4099)
    MigrationFailed,
    DowngradeRefused,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    RegistrationFailed,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::BadRequest => 1000,
            Self::InvalidParameters => 1001,
            Self::MissingRequiredField => 1002,
            Self::InvalidCronSpec => 1003,

            Self::ObjectNotFound => 1100,
            Self::UnknownJob => 1101,

            Self::UniqueConflict => 1200,
            Self::AlreadyRegistered => 1201,

            Self::StatusMismatch => 1300,
            Self::InvalidStatus => 1301,

            Self::NoElements => 1400,
            Self::LockUnavailable => 1401,

            Self::RedisError => 2000,
            Self::RedisConnectionFailed => 2001,
            Self::ScriptFailed => 2002,

            Self::SerializationError => 2100,
            Self::DeserializationError => 2101,

            Self::HookSendFailed => 3000,
            Self::HookTimeout => 3001,
            Self::NetworkError => 3002,

            Self::HandlerFailed => 3100,
            Self::HandlerPanicked => 3101,

            Self::MigrationFailed => 4000,
            Self::DowngradeRefused => 4001,

            Self::ConfigurationError => 5000,
            Self::RegistrationFailed => 5001,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RedisError
                | Self::RedisConnectionFailed
                | Self::LockUnavailable
                | Self::HookSendFailed
                | Self::HookTimeout
                | Self::NetworkError
        )
    }

    /// Check if this error must abort process initialisation.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RegistrationFailed | Self::ConfigurationError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "validation",
            1100..=1199 => "lookup",
            1200..=1299 => "conflict",
            1300..=1399 => "lifecycle",
            1400..=1499 => "queue",
            2000..=2099 => "redis",
            2100..=2199 => "serialization",
            3000..=3099 => "hook",
            3100..=3199 => "handler",
            4000..=4099 => "migration",
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
    /// Caller errors and expected soft outcomes
    Low,
    /// Operational issues (timeouts, webhook failures)
    Medium,
    /// System errors (Redis failures, handler crashes)
    High,
    /// Errors that stop the service from starting or running
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::BadRequest
            | ErrorCode::InvalidParameters
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidCronSpec
            | ErrorCode::ObjectNotFound
            | ErrorCode::UnknownJob
            | ErrorCode::UniqueConflict
            | ErrorCode::StatusMismatch
            | ErrorCode::NoElements => Self::Low,

            ErrorCode::InvalidStatus
            | ErrorCode::LockUnavailable
            | ErrorCode::HookSendFailed
            | ErrorCode::HookTimeout
            | ErrorCode::NetworkError
            | ErrorCode::HandlerFailed => Self::Medium,

            ErrorCode::RedisError
            | ErrorCode::ScriptFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::HandlerPanicked
            | ErrorCode::MigrationFailed
            | ErrorCode::AlreadyRegistered => Self::High,

            ErrorCode::RedisConnectionFailed
            | ErrorCode::DowngradeRefused
            | ErrorCode::ConfigurationError
            | ErrorCode::RegistrationFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
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

    /// Related entity ID (job, policy, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// HTTP response body returned by a webhook endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
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

    pub fn with_response_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the job service.
#[derive(Error, Debug)]
pub struct JobServiceError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,

    /// Backtrace for debugging (captured in debug builds)
    #[cfg(debug_assertions)]
    #[allow(dead_code)]
    backtrace: Option<std::backtrace::Backtrace>,
}

impl fmt::Display for JobServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl JobServiceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
            #[cfg(debug_assertions)]
            backtrace: Some(std::backtrace::Backtrace::capture()),
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::ObjectNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// The persisted state is already newer than the attempted write.
    pub fn is_status_mismatch(&self) -> bool {
        self.code == ErrorCode::StatusMismatch
    }

    /// A sorted-set pop found nothing to pop.
    pub fn is_no_elements(&self) -> bool {
        self.code == ErrorCode::NoElements
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::ObjectNotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::UniqueConflict
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
                    user_message = %self.user_message,
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
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
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
            "jobservice_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let message = message.into();
            JobServiceError::with_internal(ErrorCode::InternalError, message, e.to_string())
                .with_source(e)
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| JobServiceError::new(ErrorCode::ObjectNotFound, message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for JobServiceError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::RedisConnectionFailed, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::RedisError, "Redis operation timed out")
        } else if error.kind() == redis::ErrorKind::NoScriptError {
            (ErrorCode::ScriptFailed, "Redis script is not loaded")
        } else {
            (ErrorCode::RedisError, "A Redis error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for JobServiceError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for JobServiceError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::HookTimeout, "Webhook request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to webhook endpoint")
        } else if error.is_status() {
            (ErrorCode::HookSendFailed, "Webhook endpoint returned an error")
        } else if error.is_builder() {
            (ErrorCode::BadRequest, "Invalid webhook request")
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for JobServiceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::ObjectNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::NetworkError, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for JobServiceError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<JobServiceError>() {
            Ok(inner) => inner,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for JobServiceError {
    fn from(error: config::ConfigError) -> Self {
        let user_msg = match &error {
            config::ConfigError::NotFound(_) => "Required configuration not found",
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                "Configuration file is invalid"
            }
            _ => "Configuration error occurred",
        };

        Self::with_internal(ErrorCode::ConfigurationError, user_msg, error.to_string())
    }
}

impl From<semver::Error> for JobServiceError {
    fn from(error: semver::Error) -> Self {
        Self::with_internal(
            ErrorCode::MigrationFailed,
            "Invalid schema version",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<cron::error::Error> for JobServiceError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCronSpec,
            "Invalid cron spec",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl JobServiceError {
    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The persisted status refused the attempted transition.
    pub fn status_mismatch(
        job_id: impl Into<String>,
        current: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        let current = current.into();
        let target = target.into();
        Self::new(
            ErrorCode::StatusMismatch,
            format!("Status of job {} is {}; transition to {} refused", job_id, current, target),
        )
        .with_details(ErrorDetails::new().with_entity("job", &job_id))
        .with_context("current", current)
        .with_context("target", target)
    }

    pub fn invalid_status(status: impl Into<String>) -> Self {
        let status = status.into();
        Self::new(ErrorCode::InvalidStatus, format!("Invalid job status: {}", status))
            .with_context("status", status)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queue Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Nothing to pop from a sorted set.
    pub fn no_elements(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::NoElements, format!("No elements in {}", key))
            .with_context("key", key)
    }

    /// A unique job with identical name and parameters is already queued or running.
    pub fn unique_conflict(job_name: impl Into<String>) -> Self {
        let job_name = job_name.into();
        Self::new(
            ErrorCode::UniqueConflict,
            format!("Unique job {} with the same parameters already exists", job_name),
        )
        .with_context("job_name", job_name)
    }

    pub fn lock_unavailable(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::LockUnavailable, format!("Failed to acquire lock {}", key))
            .with_context("key", key)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Handler Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn unknown_job(job_name: impl Into<String>) -> Self {
        let job_name = job_name.into();
        Self::new(ErrorCode::UnknownJob, format!("Job {} is not registered", job_name))
            .with_details(ErrorDetails::new().with_entity("job_name", &job_name))
    }

    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidParameters,
            format!("Invalid job parameters: {}", reason.into()),
        )
    }

    /// A handler returned an error from its run.
    pub fn handler_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerFailed, reason.into())
    }

    pub fn handler_panicked(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::HandlerPanicked,
            format!("Runtime error: {}", message.into()),
            stack,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hook Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A webhook endpoint answered with a non-success status.
    pub fn hook_rejected(url: impl Into<String>, status: u16, body: Option<String>) -> Self {
        let url = url.into();
        let mut details = ErrorDetails::new()
            .with_entity("webhook", &url)
            .with_context("status", status);
        if let Some(body) = body {
            details = details.with_response_body(body);
        }
        Self::new(
            ErrorCode::HookSendFailed,
            format!("Webhook {} responded with status {}", url, status),
        )
        .with_details(details)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Migration Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn migration_failed(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::MigrationFailed, reason.into())
    }

    pub fn downgrade_refused(current: impl Into<String>, target: impl Into<String>) -> Self {
        let current = current.into();
        let target = target.into();
        Self::new(
            ErrorCode::DowngradeRefused,
            format!("Persisted schema version {} is newer than {}", current, target),
        )
        .with_context("current", current)
        .with_context("target", target)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// Registration misuse; aborts start-up.
    pub fn registration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RegistrationFailed, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::RedisConnectionFailed.is_retryable());
        assert!(ErrorCode::HookSendFailed.is_retryable());
        assert!(!ErrorCode::StatusMismatch.is_retryable());
        assert!(!ErrorCode::UniqueConflict.is_retryable());
    }

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::StatusMismatch.category(), "lifecycle");
        assert_eq!(ErrorCode::NoElements.category(), "queue");
        assert_eq!(ErrorCode::ScriptFailed.category(), "redis");
        assert_eq!(ErrorCode::DowngradeRefused.category(), "migration");
        assert!(ErrorCode::RegistrationFailed.is_fatal());
        assert!(!ErrorCode::HandlerFailed.is_fatal());
    }

    #[test]
    fn test_typed_predicates() {
        assert!(JobServiceError::status_mismatch("j1", "Success", "Running").is_status_mismatch());
        assert!(JobServiceError::no_elements("ns:hook_events").is_no_elements());
        assert!(JobServiceError::not_found("job", "j1").is_not_found());
        assert!(JobServiceError::unique_conflict("sample").is_conflict());
        assert!(!JobServiceError::internal("boom").is_status_mismatch());
    }

    #[test]
    fn test_hook_rejected_keeps_body() {
        let err = JobServiceError::hook_rejected("http://hook", 500, Some("down".to_string()));
        assert_eq!(err.code(), ErrorCode::HookSendFailed);
        assert_eq!(err.details().response_body.as_deref(), Some("down"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::StatusMismatch), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::HookTimeout), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::RedisError), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::RegistrationFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u8> = None;
        let err = missing.context("stats gone").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let error = JobServiceError::with_internal(
            ErrorCode::RedisError,
            "A Redis error occurred",
            "Connection refused: localhost:6379",
        );

        let display = format!("{}", error);
        assert!(display.contains("RedisError"));
        assert!(display.contains("A Redis error occurred"));
        assert!(display.contains("Connection refused"));
    }
}
