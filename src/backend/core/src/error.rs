//! Error handling for the consent core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable code and a user-safe message
//! - The recoverable-vs-fatal classification used by the bridge sync channel
//! - HTTP status code mapping for the intake API
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use consent_core::error::{ConsentError, Result, ErrorContext, ErrorCode};
//!
//! fn decode(payload: &str) -> Result<Vec<u8>> {
//!     base64_decode(payload).with_error_code(ErrorCode::MalformedPayload)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
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

/// A specialized Result type for consent operations.
pub type Result<T> = std::result::Result<T, ConsentError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Command Handling Errors (1000-1099)
    UnknownCommand,
    AggregateCancelled,
    ConcurrencyConflict,
    AggregateNotFound,
    NoCommandHandler,
    InvalidEventData,
    AggregateClosed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Crypto Errors (2300-2399)
    CryptoError,
    KeyNotFound,
    InvalidPublicKey,
    DecryptionFailed,
    SigningFailed,

    // Transport Errors (3000-3099)
    TransportUnavailable,
    RegistryUnavailable,
    MalformedPayload,
    OrganizationNotFound,

    // Validation Errors (4100-4199)
    ValidationError,
    ConsentFactInvalid,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::UnknownCommand => 1000,
            Self::AggregateCancelled => 1001,
            Self::ConcurrencyConflict => 1002,
            Self::AggregateNotFound => 1003,
            Self::NoCommandHandler => 1004,
            Self::InvalidEventData => 1005,
            Self::AggregateClosed => 1006,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::CryptoError => 2300,
            Self::KeyNotFound => 2301,
            Self::InvalidPublicKey => 2302,
            Self::DecryptionFailed => 2303,
            Self::SigningFailed => 2304,

            Self::TransportUnavailable => 3001,
            Self::RegistryUnavailable => 3002,
            Self::MalformedPayload => 3003,
            Self::OrganizationNotFound => 3004,

            Self::ValidationError => 4100,
            Self::ConsentFactInvalid => 4101,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationError | Self::MalformedPayload => StatusCode::BAD_REQUEST,

            Self::AggregateNotFound | Self::OrganizationNotFound | Self::KeyNotFound => {
                StatusCode::NOT_FOUND
            }

            Self::ConcurrencyConflict | Self::AggregateCancelled | Self::AggregateClosed => {
                StatusCode::CONFLICT
            }

            Self::ConsentFactInvalid | Self::UnknownCommand | Self::InvalidEventData => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            Self::TransportUnavailable | Self::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            Self::NoCommandHandler
            | Self::SerializationError
            | Self::DeserializationError
            | Self::CryptoError
            | Self::InvalidPublicKey
            | Self::DecryptionFailed
            | Self::SigningFailed
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is recoverable.
    ///
    /// Recoverable failures are retried (command conflicts) or re-queued on the
    /// bridge retry channel. Everything else is fatal.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict | Self::TransportUnavailable | Self::RegistryUnavailable
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "command",
            2200..=2299 => "serialization",
            2300..=2399 => "crypto",
            3000..=3099 => "transport",
            4100..=4199 => "validation",
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

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Business rule rejections and bad input
    Low,
    /// Conflicts and unreachable collaborators
    Medium,
    /// Trust and data problems
    High,
    /// The node cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::ConsentFactInvalid
            | ErrorCode::UnknownCommand
            | ErrorCode::AggregateCancelled
            | ErrorCode::AggregateClosed
            | ErrorCode::AggregateNotFound
            | ErrorCode::OrganizationNotFound => Self::Low,

            ErrorCode::ConcurrencyConflict
            | ErrorCode::TransportUnavailable
            | ErrorCode::RegistryUnavailable
            | ErrorCode::MalformedPayload
            | ErrorCode::KeyNotFound => Self::Medium,

            ErrorCode::InvalidEventData
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::CryptoError
            | ErrorCode::InvalidPublicKey
            | ErrorCode::DecryptionFailed
            | ErrorCode::SigningFailed
            | ErrorCode::NoCommandHandler
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::InternalError => Self::Critical,
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

    /// Related entity ID (aggregate, organization, ...)
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

/// The main error type for the consent core.
#[derive(Error, Debug)]
pub struct ConsentError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConsentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConsentError {
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

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
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

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
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

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is recoverable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
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
            "consent_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body returned by the intake API: one cause, never a list.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

impl From<&ConsentError> for ErrorResponse {
    fn from(error: &ConsentError) -> Self {
        Self {
            message: error.user_message.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for ConsentError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConsentError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ConsentError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConsentError::new(ErrorCode::AggregateNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConsentError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ConsentError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<axum::extract::rejection::JsonRejection> for ConsentError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        use axum::extract::rejection::JsonRejection;

        let code = match &rejection {
            JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
                ErrorCode::ValidationError
            }
            _ => ErrorCode::MalformedPayload,
        };
        Self::new(code, rejection.body_text()).with_source(rejection)
    }
}

impl From<base64::DecodeError> for ConsentError {
    fn from(error: base64::DecodeError) -> Self {
        Self::with_internal(
            ErrorCode::MalformedPayload,
            "Invalid base64 data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<hex::FromHexError> for ConsentError {
    fn from(error: hex::FromHexError) -> Self {
        Self::with_internal(ErrorCode::MalformedPayload, "Invalid hex data", error.to_string())
            .with_source(error)
    }
}

impl From<rsa::Error> for ConsentError {
    fn from(error: rsa::Error) -> Self {
        let code = match &error {
            rsa::Error::Decryption => ErrorCode::DecryptionFailed,
            rsa::Error::Verification => ErrorCode::SigningFailed,
            _ => ErrorCode::CryptoError,
        };
        Self::with_internal(code, "A cryptographic operation failed", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for ConsentError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for ConsentError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ConsentError>() {
            Ok(consent_error) => consent_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ConsentError {
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

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConsentError {
    // ─────────────────────────────────────────────────────────────────────────
    // Command Handling
    // ─────────────────────────────────────────────────────────────────────────

    /// The target aggregate does not recognize the command type.
    pub fn unknown_command(command_type: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownCommand, "unknown command")
            .with_context("command_type", command_type.to_string())
    }

    /// The aggregate was cancelled and accepts no further commands.
    pub fn aggregate_cancelled(aggregate_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::AggregateCancelled, "aggregate cancelled")
            .with_details(ErrorDetails::new().with_entity("consent", aggregate_id.to_string()))
    }

    /// The aggregate reached a final status and accepts no further commands.
    pub fn aggregate_closed(aggregate_id: uuid::Uuid, status: impl fmt::Display) -> Self {
        Self::new(ErrorCode::AggregateClosed, format!("aggregate already {}", status))
            .with_details(ErrorDetails::new().with_entity("consent", aggregate_id.to_string()))
    }

    /// Optimistic version mismatch on append.
    pub fn concurrency_conflict(stream: impl fmt::Display, expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorCode::ConcurrencyConflict,
            format!(
                "concurrency conflict on {}: expected version {}, found {}",
                stream, expected, actual
            ),
        )
        .with_context("expected_version", expected)
        .with_context("actual_version", actual)
    }

    /// The aggregate has not been created yet.
    pub fn aggregate_not_found(aggregate_type: impl fmt::Display, aggregate_id: uuid::Uuid) -> Self {
        Self::new(
            ErrorCode::AggregateNotFound,
            format!("{} not found: {}", aggregate_type, aggregate_id),
        )
        .with_details(ErrorDetails::new().with_entity(aggregate_type.to_string(), aggregate_id.to_string()))
    }

    /// No runtime is registered for the command type.
    pub fn no_handler(command_type: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::NoCommandHandler,
            format!("no handler registered for command {}", command_type),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Crypto
    // ─────────────────────────────────────────────────────────────────────────

    /// A cryptographic primitive failed.
    pub fn crypto(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::CryptoError, "A cryptographic operation failed", message)
    }

    /// No private key is held for the given entity.
    pub fn key_not_found(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self::new(ErrorCode::KeyNotFound, format!("no private key for {}", entity))
            .with_details(ErrorDetails::new().with_entity("legal_entity", entity))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    /// A transport failure worth re-queueing on the retry channel.
    pub fn transport_recoverable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::TransportUnavailable, message)
    }

    /// Undecodable bridge payload.
    pub fn malformed_payload(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::MalformedPayload, message)
    }

    /// The registry could not be reached or answered with an error.
    pub fn registry_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RegistryUnavailable, message)
    }

    /// The organization is not present in the registry.
    pub fn organization_not_found(organization_id: impl Into<String>) -> Self {
        let organization_id = organization_id.into();
        Self::new(
            ErrorCode::OrganizationNotFound,
            format!("organization not found: {}", organization_id),
        )
        .with_details(ErrorDetails::new().with_entity("organization", organization_id))
    }

    /// A consent fact failed structural validation.
    pub fn invalid_fact(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConsentFactInvalid, message)
    }
}
