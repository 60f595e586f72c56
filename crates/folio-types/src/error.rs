//! Error taxonomy for Folio.
//!
//! `StructuredError` is the single error shape crossing component
//! boundaries. It carries a stable `ErrorCode`, the `ErrorKind` of the
//! operation that raised it, a timestamp, merged diagnostic context and an
//! optional upstream cause. Handling sites match on `ErrorCode::class()`
//! instead of inspecting concrete error types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::ErrorContext;
use crate::retry::RetryStats;
use crate::workflow::Stage;

/// Errors from repository operations (used by trait definitions in folio-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

// ---------------------------------------------------------------------------
// Codes and classes
// ---------------------------------------------------------------------------

/// How a failure is handled, independent of where it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Precondition failed. Never retried.
    Validation,
    /// Network, timeout, rate limit or server fault. Retried.
    Transient,
    /// The outline contains a dependency cycle. Aborts spawning.
    DependencyCycle,
    /// Retries or recoveries ran out.
    RetryExhausted,
    /// Checkpoint or session write failed. Logged, never propagated.
    Persistence,
    /// Never recoverable regardless of attempt count.
    Critical,
    /// Plain error without a code; retryability decided by its message.
    Unclassified,
}

impl ErrorClass {
    /// Whether a user-triggered retry of the same stage is meaningful.
    pub fn user_retryable(self) -> bool {
        match self {
            ErrorClass::Transient | ErrorClass::RetryExhausted | ErrorClass::Unclassified => true,
            ErrorClass::Validation
            | ErrorClass::DependencyCycle
            | ErrorClass::Persistence
            | ErrorClass::Critical => false,
        }
    }
}

/// Stable, machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,
    ValidationFailed,
    InvalidTransition,
    UnknownDependency,
    DuplicateUnit,
    ToolTimeout,
    ToolRateLimit,
    ToolNetwork,
    ToolServer,
    ToolClient,
    EmptyResponse,
    CircularDependency,
    RetryExhausted,
    MaxRetriesExceeded,
    UnitGenerationFailed,
    PersistenceFailed,
    CriticalWorkflow,
}

impl ErrorCode {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorCode::Internal => ErrorClass::Unclassified,
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidTransition
            | ErrorCode::UnknownDependency
            | ErrorCode::DuplicateUnit
            | ErrorCode::ToolClient => ErrorClass::Validation,
            ErrorCode::ToolTimeout
            | ErrorCode::ToolRateLimit
            | ErrorCode::ToolNetwork
            | ErrorCode::ToolServer
            | ErrorCode::EmptyResponse => ErrorClass::Transient,
            ErrorCode::CircularDependency => ErrorClass::DependencyCycle,
            ErrorCode::RetryExhausted
            | ErrorCode::MaxRetriesExceeded
            | ErrorCode::UnitGenerationFailed => ErrorClass::RetryExhausted,
            ErrorCode::PersistenceFailed => ErrorClass::Persistence,
            ErrorCode::CriticalWorkflow => ErrorClass::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Internal => "internal",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::UnknownDependency => "unknown_dependency",
            ErrorCode::DuplicateUnit => "duplicate_unit",
            ErrorCode::ToolTimeout => "tool_timeout",
            ErrorCode::ToolRateLimit => "tool_rate_limit",
            ErrorCode::ToolNetwork => "tool_network",
            ErrorCode::ToolServer => "tool_server",
            ErrorCode::ToolClient => "tool_client",
            ErrorCode::EmptyResponse => "empty_response",
            ErrorCode::CircularDependency => "circular_dependency",
            ErrorCode::RetryExhausted => "retry_exhausted",
            ErrorCode::MaxRetriesExceeded => "max_retries_exceeded",
            ErrorCode::UnitGenerationFailed => "unit_generation_failed",
            ErrorCode::PersistenceFailed => "persistence_failed",
            ErrorCode::CriticalWorkflow => "critical_workflow",
        }
    }

    /// Map an HTTP status from a collaborator onto a code.
    pub fn from_http_status(status: u16) -> ErrorCode {
        match status {
            408 => ErrorCode::ToolTimeout,
            429 => ErrorCode::ToolRateLimit,
            400..=499 => ErrorCode::ToolClient,
            500..=599 => ErrorCode::ToolServer,
            _ => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the failing operation lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    Generic,
    ToolOperation { tool_name: String },
    StorageOperation { operation: String },
    WorkflowStage { stage: Stage },
}

// ---------------------------------------------------------------------------
// StructuredError
// ---------------------------------------------------------------------------

/// Message fragments that mark a plain error as transient.
const RETRYABLE_SIGNATURES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "eai_again",
    "socket hang up",
    "connection reset",
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "internal server error",
];

/// Structured, enrichable error.
#[derive(Debug, Clone)]
pub struct StructuredError {
    /// Identity of the original failure; preserved across enrichment.
    pub id: Uuid,
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub context: ErrorContext,
    /// Present once a retry loop gave up on this error.
    pub retry: Option<RetryStats>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl StructuredError {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            code,
            message: message.into(),
            occurred_at: Utc::now(),
            context: ErrorContext::default(),
            retry: None,
            cause: None,
        }
    }

    pub fn generic(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, code, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::generic(ErrorCode::ValidationFailed, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::generic(ErrorCode::CriticalWorkflow, message)
    }

    pub fn tool(tool_name: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ToolOperation {
                tool_name: tool_name.into(),
            },
            code,
            message,
        )
    }

    /// Tool failure derived from an HTTP status returned by a collaborator.
    pub fn from_http_status(tool_name: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::tool(
            tool_name,
            ErrorCode::from_http_status(status),
            format!("HTTP {status}: {message}"),
        )
        .with_context_field("httpStatus", status)
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::StorageOperation {
                operation: operation.into(),
            },
            ErrorCode::PersistenceFailed,
            message,
        )
    }

    pub fn stage(stage: Stage, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkflowStage { stage }, code, message)
    }

    /// Wrap a foreign error into the generic kind, keeping it as the cause.
    pub fn wrap<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let original = err.to_string();
        let mut wrapped = Self::generic(ErrorCode::Internal, original.clone());
        wrapped
            .context
            .extra
            .insert("originalError".to_string(), original.into());
        wrapped.cause = Some(Arc::new(err));
        wrapped
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = self.context.merged_with(&context);
        self
    }

    pub fn with_context_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_stats(mut self, stats: RetryStats) -> Self {
        self.retry = Some(stats);
        self
    }

    /// Same error identity with a replaced context (used by enrichment).
    pub fn rebuilt_with_context(&self, context: ErrorContext) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The cause, if it is itself a structured error.
    pub fn structured_cause(&self) -> Option<&StructuredError> {
        self.cause()
            .and_then(|c| (c as &(dyn std::error::Error + 'static)).downcast_ref::<StructuredError>())
    }

    pub fn http_status(&self) -> Option<u16> {
        self.context
            .extra
            .get("httpStatus")
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Default retryability: transient codes, plus plain errors whose
    /// message or HTTP status carries a transient signature.
    pub fn is_retryable(&self) -> bool {
        match self.class() {
            ErrorClass::Transient => true,
            ErrorClass::Unclassified => {
                if let Some(status) = self.http_status() {
                    return status == 429 || (500..=599).contains(&status);
                }
                let message = self.message.to_lowercase();
                RETRYABLE_SIGNATURES.iter().any(|sig| message.contains(sig))
                    || message
                        .split(|c: char| !c.is_ascii_digit())
                        .filter_map(|tok| tok.parse::<u16>().ok())
                        .any(|n| n == 429 || (500..=599).contains(&n))
            }
            ErrorClass::Validation
            | ErrorClass::DependencyCycle
            | ErrorClass::RetryExhausted
            | ErrorClass::Persistence
            | ErrorClass::Critical => false,
        }
    }

    /// Whether node-level recovery may re-run the failing node.
    pub fn is_recoverable(&self) -> bool {
        self.is_retryable()
    }

    /// JSON view for logs and persisted error reports.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "kind": self.kind,
            "code": self.code,
            "message": self.message,
            "timestamp": self.occurred_at.to_rfc3339(),
            "context": self.context,
            "retry": self.retry,
            "cause": self.cause().map(|c| c.to_string()),
        })
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<RepositoryError> for StructuredError {
    fn from(err: RepositoryError) -> Self {
        StructuredError::storage("repository", err.to_string()).with_cause(err)
    }
}
