use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in dagflow-core).
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

/// Stable, caller-facing error codes.
///
/// These strings are part of the command surface contract and never change
/// between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-wide error type.
///
/// `Retryable` is the subset of internal failures that the bus consumer
/// answers with a delayed redelivery instead of a dead letter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or missing input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Store/bus failure or invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transient failure (store unavailable, lock contention).
    #[error("retryable error: {0}")]
    Retryable(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        EngineError::Retryable(msg.into())
    }

    /// The stable code reported to callers. Retryable failures surface as
    /// `INTERNAL`.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            EngineError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            EngineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Internal(_) | EngineError::Retryable(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Retryable(_))
    }

    /// Build the structured failure returned to callers.
    ///
    /// Internal details stay in the logs; callers only see a generic message
    /// for `INTERNAL` failures.
    pub fn to_failure(&self) -> CommandFailure {
        let message = match self {
            EngineError::Internal(_) => "internal engine error".to_string(),
            EngineError::Retryable(_) => {
                "engine temporarily unavailable, retry later".to_string()
            }
            other => other.to_string(),
        };
        CommandFailure {
            code: self.code(),
            message,
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Connection => EngineError::Retryable(e.to_string()),
            RepositoryError::Query(_) => EngineError::Retryable(e.to_string()),
            RepositoryError::NotFound => EngineError::NotFound("entity".to_string()),
            RepositoryError::Conflict(msg) => EngineError::Internal(format!("conflict: {msg}")),
        }
    }
}

/// Structured failure returned by the command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub code: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_repository_errors_map_to_engine_kinds() {
        assert!(EngineError::from(RepositoryError::Connection).is_retryable());
        assert!(EngineError::from(RepositoryError::Query("locked".into())).is_retryable());
        assert_eq!(
            EngineError::from(RepositoryError::NotFound).code(),
            ErrorCode::NotFound
        );
        let conflict = EngineError::from(RepositoryError::Conflict("dup".into()));
        assert_eq!(conflict.code(), ErrorCode::Internal);
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_retryable_reports_internal_code() {
        let err = EngineError::retryable("lock busy");
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_hides_internal_details() {
        let err = EngineError::internal("disk I/O error at page 42");
        let failure = err.to_failure();
        assert_eq!(failure.code, ErrorCode::Internal);
        assert!(!failure.message.contains("page 42"));
    }

    #[test]
    fn test_failure_keeps_caller_errors() {
        let failure = EngineError::invalid("nodes must not be empty").to_failure();
        assert_eq!(failure.code, ErrorCode::InvalidArgument);
        assert!(failure.message.contains("nodes must not be empty"));
    }

    #[test]
    fn test_error_code_serializes_as_stable_string() {
        let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"PERMISSION_DENIED\"");
        assert_eq!(ErrorCode::NotFound.to_string(), "NOT_FOUND");
    }
}
