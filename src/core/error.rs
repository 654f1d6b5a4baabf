use crate::core::model::{ErrorCode, SessionId};
use std::path::PathBuf;

/// Structured error surfaced to callers: a numeric code plus a readable message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code}, {})", .code.code())]
pub struct SplitInstallError {
    code: ErrorCode,
    message: String,
}

impl SplitInstallError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.code
    }

    pub fn code(&self) -> i32 {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn module_unavailable(module: &str) -> Self {
        Self::new(ErrorCode::ModuleUnavailable, format!("module '{}' is not available", module))
    }

    pub fn active_sessions_limit_exceeded(existing: SessionId) -> Self {
        Self::new(
            ErrorCode::ActiveSessionsLimitExceeded,
            format!("request overlaps active session {}", existing),
        )
    }

    pub fn session_not_found(session_id: SessionId) -> Self {
        Self::new(ErrorCode::SessionNotFound, format!("no active session {}", session_id))
    }

    pub fn api_not_available() -> Self {
        Self::new(ErrorCode::ApiNotAvailable, "engine has been shut down")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Error returned by the synchronous result accessor of a task.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskResultError {
    #[error("task is not yet complete")]
    NotComplete,

    #[error("task failed: {0}")]
    Failed(#[source] SplitInstallError),
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid archive {}: {reason}", .path.display())]
    Archive { path: PathBuf, reason: String },

    /// Entry would land outside the destination directory.
    #[error("archive entry '{name}' escapes the destination directory")]
    UnsafeEntry { name: String },
}
