//! Error taxonomy for lifecycle and backup operations, with the HTTP
//! status-code mapping the IPC handlers rely on.
//!
//! A server crash is deliberately NOT represented here: crashes are a
//! lifecycle state, not an error. Nothing in this enum is fatal to the
//! daemon, only to the operation attempted.

use std::path::PathBuf;

use axum::http::StatusCode;

use super::state_machine::LifecycleState;
use crate::process::ProcessError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The executable or working directory is missing/invalid. Fatal to
    /// the start attempt; the operator must fix path or config.
    #[error("failed to start server process: {0}")]
    SpawnFailed(String),

    /// Required server files are absent (jar or accepted EULA marker).
    #[error("server directory is not bootstrapped: {0}")]
    NotBootstrapped(String),

    #[error("server is already running (state: {0})")]
    AlreadyRunning(LifecycleState),

    #[error("server is not running (state: {0})")]
    NotRunning(LifecycleState),

    /// Another lifecycle transition is already in flight. Concurrent
    /// start/stop calls fail instead of queuing.
    #[error("a lifecycle transition is already in progress")]
    TransitionInProgress,

    /// Restore precondition unmet: the world directory may not be
    /// replaced underneath a live process.
    #[error("server must be stopped first (state: {0})")]
    ServerRunning(LifecycleState),

    /// Disk or permission trouble during backup/restore, with the path
    /// that failed.
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// HTTP status code for IPC responses.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotBootstrapped(_) => StatusCode::PRECONDITION_FAILED,
            Self::AlreadyRunning(_) | Self::NotRunning(_) | Self::ServerRunning(_) => {
                StatusCode::CONFLICT
            }
            Self::TransitionInProgress => StatusCode::CONFLICT,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::NotBootstrapped(_) => "NOT_BOOTSTRAPPED",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::TransitionInProgress => "TRANSITION_IN_PROGRESS",
            Self::ServerRunning(_) => "SERVER_RUNNING",
            Self::Io { .. } => "IO_FAILURE",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl From<ProcessError> for SupervisorError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::SpawnFailed { .. } => Self::SpawnFailed(e.to_string()),
            // The state the caller saw is stale by definition here; report
            // the stopped end state.
            ProcessError::NotRunning => Self::NotRunning(LifecycleState::Stopped),
        }
    }
}

/// Lets axum handlers return a SupervisorError directly.
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
