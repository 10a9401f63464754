//! Error handling for the Taskmill engine.
//!
//! This module provides:
//! - A single engine error type with context and chaining
//! - Error codes for machine-readable classification
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Task handlers do not use [`EngineError`]; they return [`TaskError`], which
//! is a plain value the result processor classifies through the retry policy.
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskmill_core::error::{EngineError, Result};
//!
//! fn pick(storage: &dyn Storage) -> Result<Option<Job>> {
//!     storage.pick_job(&queues).await.map_err(|err| {
//!         err.log();
//!         err
//!     })
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

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Storage Errors (1000-1099)
    StorageError,
    StorageUnavailable,
    RecordNotFound,

    // Resilience Errors (1100-1199)
    CircuitOpen,

    // Task Errors (1200-1299)
    TaskNotFound,
    TaskTimeout,
    TaskPanicked,

    // Scheduling Errors (1300-1399)
    InvalidCronExpression,

    // Serialization Errors (2000-2099)
    SerializationError,
    DeserializationError,

    // Configuration Errors (4000-4099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Lifecycle Errors (5000-5099)
    ShutdownTimeout,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::StorageError => 1000,
            Self::StorageUnavailable => 1001,
            Self::RecordNotFound => 1002,

            Self::CircuitOpen => 1100,

            Self::TaskNotFound => 1200,
            Self::TaskTimeout => 1201,
            Self::TaskPanicked => 1202,

            Self::InvalidCronExpression => 1300,

            Self::SerializationError => 2000,
            Self::DeserializationError => 2001,

            Self::ConfigurationError => 4000,
            Self::MissingConfiguration => 4001,
            Self::InvalidConfiguration => 4002,

            Self::ShutdownTimeout => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is transient.
    ///
    /// Storage errors flagged here are the ones the circuit breaker counts.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageError
                | Self::StorageUnavailable
                | Self::CircuitOpen
                | Self::TaskTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "storage",
            1100..=1199 => "resilience",
            1200..=1299 => "task",
            1300..=1399 => "scheduling",
            2000..=2099 => "serialization",
            4000..=4099 => "configuration",
            5000..=5099 => "lifecycle",
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

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected conditions (missing records, open breaker)
    Low,
    /// Operational issues (timeouts, transient storage failures)
    Medium,
    /// Defects or misconfiguration
    High,
    /// Engine cannot continue
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::RecordNotFound | ErrorCode::CircuitOpen => Self::Low,

            ErrorCode::StorageError
            | ErrorCode::StorageUnavailable
            | ErrorCode::TaskTimeout
            | ErrorCode::ShutdownTimeout => Self::Medium,

            ErrorCode::TaskNotFound
            | ErrorCode::TaskPanicked
            | ErrorCode::InvalidCronExpression
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::High,

            ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
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

    /// Related entity ID (job, cron job, queue)
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

}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the engine.
#[derive(Error, Debug)]
pub struct EngineError {
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
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl EngineError {
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
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is transient.
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
                    internal_message = ?self.internal_message,
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

    fn record_metrics(&self) {
        counter!(
            "taskmill_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON payload", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TaskTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::StorageUnavailable, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::StorageUnavailable, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<EngineError>() {
            Ok(engine_error) => engine_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
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

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl EngineError {
    /// Storage call failed.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StorageError, "Storage operation failed", message)
    }

    /// Storage is unreachable.
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StorageUnavailable, "Storage is unavailable", message)
    }

    /// The circuit breaker rejected the call.
    pub fn circuit_open() -> Self {
        Self::new(ErrorCode::CircuitOpen, "Circuit breaker is open")
    }

    /// No handler registered under the given name.
    pub fn task_not_found(handler: impl Into<String>) -> Self {
        let handler = handler.into();
        Self::new(ErrorCode::TaskNotFound, format!("No task registered as '{}'", handler))
            .with_details(ErrorDetails::new().with_entity("task", handler))
    }

    /// Invalid cron expression.
    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        let expression = expression.into();
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            format!("Invalid cron expression '{}'", expression),
            reason,
        )
    }

    /// Invalid configuration value.
    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// Graceful shutdown did not finish in time.
    pub fn shutdown_timeout(timeout: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::ShutdownTimeout,
            format!("Workers did not stop within {:?}", timeout),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a task handler.
///
/// Every task error is subject to the retry policy; there is no "fatal"
/// escape hatch, a job that keeps failing simply exhausts its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error message
    pub message: String,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
    /// Set when the handler exceeded its timeout
    #[serde(default)]
    pub timed_out: bool,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            context: None,
            timed_out: false,
        }
    }

    /// The handler ran past its budget.
    pub fn timeout(limit: std::time::Duration) -> Self {
        Self {
            message: format!("Task exceeded its timeout of {:?}", limit),
            code: Some(ErrorCode::TaskTimeout.to_string()),
            context: None,
            timed_out: true,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<EngineError> for TaskError {
    fn from(error: EngineError) -> Self {
        Self {
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
            context: None,
            timed_out: error.code() == ErrorCode::TaskTimeout,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

/// Result type returned by task handlers.
pub type TaskResult = std::result::Result<(), TaskError>;
