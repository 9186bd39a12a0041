//! Error handling for Huddle Core.
//!
//! This module provides:
//! - A stable, machine-readable [`ErrorCode`] taxonomy for the wire protocol
//! - HTTP status code mapping for the REST callers that reuse decisions
//! - User-facing messages kept separate from internal detail
//! - Retryability classification so clients know whether to poll again

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for Huddle operations.
pub type Result<T> = std::result::Result<T, CollabError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are what clients switch on; reordering or
/// renaming a variant is a breaking protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authorization
    /// The caller lacks the required capability. Expected, user-facing.
    PermissionDenied,
    /// The caller's membership is no longer active. Distinct UX from a
    /// plain denial ("you were removed from this workspace").
    AccessRevoked,

    // Lookup
    WorkspaceNotFound,
    ResourceNotFound,
    MemberNotFound,
    SessionNotFound,

    // Locking
    /// The resource is held by another session. Advisory; retryable.
    LockConflict,
    /// The caller's lease expired mid-use; re-acquire.
    StaleLock,

    // Sessions
    SessionExpired,
    Disconnected,

    // Durability
    /// ActivityLog append failed. Fatal to the triggering mutation.
    StorageFailure,

    // Boundary validation
    ValidationError,
    InvalidMessage,
    SerializationError,

    // Configuration
    ConfigurationError,

    // Internal
    InternalError,
}

impl ErrorCode {
    /// HTTP status for REST callers that consume permission decisions.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::PermissionDenied | Self::AccessRevoked => StatusCode::FORBIDDEN,

            Self::WorkspaceNotFound
            | Self::ResourceNotFound
            | Self::MemberNotFound
            | Self::SessionNotFound => StatusCode::NOT_FOUND,

            Self::LockConflict | Self::StaleLock => StatusCode::CONFLICT,

            Self::SessionExpired | Self::Disconnected => StatusCode::UNAUTHORIZED,

            Self::ValidationError | Self::InvalidMessage => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StorageFailure => StatusCode::SERVICE_UNAVAILABLE,

            Self::SerializationError | Self::ConfigurationError | Self::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a client can reasonably retry the same call.
    ///
    /// Lock contention is advisory by design; permission failures are not
    /// retryable until a grant changes.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict | Self::StaleLock | Self::StorageFailure)
    }

    /// Category label for metrics grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::PermissionDenied | Self::AccessRevoked => "authz",
            Self::WorkspaceNotFound
            | Self::ResourceNotFound
            | Self::MemberNotFound
            | Self::SessionNotFound => "lookup",
            Self::LockConflict | Self::StaleLock => "locking",
            Self::SessionExpired | Self::Disconnected => "session",
            Self::StorageFailure => "durability",
            Self::ValidationError | Self::InvalidMessage | Self::SerializationError => {
                "validation"
            }
            Self::ConfigurationError => "configuration",
            Self::InternalError => "internal",
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

/// Severity level (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes: denials, contention, lookups.
    Low,
    /// Operational issues a client can recover from.
    Medium,
    /// System faults needing attention.
    High,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::PermissionDenied
            | ErrorCode::AccessRevoked
            | ErrorCode::LockConflict
            | ErrorCode::StaleLock
            | ErrorCode::WorkspaceNotFound
            | ErrorCode::ResourceNotFound
            | ErrorCode::MemberNotFound
            | ErrorCode::SessionNotFound
            | ErrorCode::ValidationError
            | ErrorCode::InvalidMessage => Self::Low,

            ErrorCode::SessionExpired
            | ErrorCode::Disconnected
            | ErrorCode::SerializationError => Self::Medium,

            ErrorCode::StorageFailure
            | ErrorCode::ConfigurationError
            | ErrorCode::InternalError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The central error type for Huddle Core.
#[derive(Error, Debug)]
pub struct CollabError {
    /// Machine-readable error code.
    code: ErrorCode,

    /// User-friendly message (safe to put on the wire).
    user_message: Cow<'static, str>,

    /// Detailed internal message (logging only).
    internal_message: Option<String>,

    /// The source error that caused this one.
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CollabError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error carrying both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// A capability check failed for an active member.
    pub fn permission_denied(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PermissionDenied, reason)
    }

    /// The member's participation in the workspace is no longer active.
    pub fn access_revoked(workspace: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::AccessRevoked,
            format!("Your access to workspace {} has been revoked", workspace),
        )
    }

    /// A lookup failed.
    pub fn not_found(code: ErrorCode, entity: impl fmt::Display) -> Self {
        Self::new(code, format!("Not found: {}", entity))
    }

    /// The session lapsed (heartbeat timeout) and was reaped.
    pub fn session_expired(session: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::SessionExpired,
            format!("Session {} has expired; reconnect to continue", session),
        )
    }

    /// A lock is held by another session.
    pub fn lock_conflict(resource: impl fmt::Display, holder: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::LockConflict,
            format!("Resource {} is locked by {}", resource, holder),
        )
    }

    /// The caller's lease is no longer current.
    pub fn stale_lock(resource: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::StaleLock,
            format!("Lock lease on {} expired; re-acquire", resource),
        )
    }

    /// An ActivityLog append failed.
    pub fn storage_failure(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StorageFailure,
            "The operation could not be recorded and was rolled back",
            detail,
        )
    }

    /// Boundary validation failure.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Missing or inconsistent configuration (e.g. a member references a
    /// role that does not exist).
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    /// Internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
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

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    fn record_metrics(&self) {
        counter!(
            "huddle_errors_total",
            "code" => format!("{}", self.code),
            "category" => self.code.category(),
        )
        .increment(1);
    }

    /// Log the error at a level matching its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low => {
                tracing::debug!(code = %self.code, "{}", self);
            }
            ErrorSeverity::Medium => {
                warn!(code = %self.code, "{}", self);
            }
            ErrorSeverity::High => {
                error!(code = %self.code, "{}", self);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire / HTTP representation
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body for error responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl From<&CollabError> for ErrorBody {
    fn from(err: &CollabError) -> Self {
        Self {
            code: err.code,
            message: err.user_message.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for CollabError {
    fn into_response(self) -> Response {
        self.log();
        let body = ErrorBody::from(&self);
        (self.code.http_status(), Json(body)).into_response()
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to encode or decode a message",
            err.to_string(),
        )
        .with_source(err)
    }
}
