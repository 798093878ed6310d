//! Error taxonomy for the sandbox core.
//!
//! Every failure that can reach a caller is a [`SandboxError`]. Each variant
//! maps to a stable [`ErrorKind`] and a safe, caller-facing message: host
//! paths, raw input and internal error text stay in the server-side log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, serializable classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A path resolved outside the workspace root.
    PathTraversal,
    /// The workspace sandbox cannot be reached or is not ready.
    SandboxUnavailable,
    /// The workspace is already running as many commands as it allows.
    SandboxBusy,
    /// A deadline elapsed. Partial results usually accompany it.
    Timeout,
    /// The resource does not exist or is not visible to the caller.
    NotFound,
    /// The caller could not be authenticated.
    Unauthorized,
    /// The request was malformed or rejected by policy.
    InvalidRequest,
    /// The decision collaborator failed or answered nonsense.
    Decision,
    /// The persistence collaborator failed.
    Persistence,
    /// An agent run hit its iteration or wall-clock ceiling.
    Aborted,
    /// The run was cancelled by the caller.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SandboxBusy | ErrorKind::Timeout | ErrorKind::Decision
        )
    }

    /// The snake_case wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PathTraversal => "path_traversal",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::SandboxBusy => "sandbox_busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Decision => "decision",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the persistence collaborator.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The keyed row does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// The backing store rejected the operation.
    #[error("store error: {0}")]
    Backend(String),
}

/// Errors raised by the decision collaborator.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// Transport or upstream failure.
    #[error("decision request failed: {0}")]
    Request(String),
    /// The response could not be understood.
    #[error("malformed decision: {0}")]
    Malformed(String),
    /// The collaborator did not answer in time.
    #[error("decision timed out")]
    Timeout,
}

/// Errors that can occur while operating a workspace sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The path would escape the workspace root.
    #[error("path escapes the workspace root")]
    PathTraversal,
    /// The sandbox cannot be reached.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    /// The sandbox refuses concurrent commands right now.
    #[error("sandbox busy: {0} command(s) already running")]
    SandboxBusy(usize),
    /// A deadline elapsed.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    /// Missing or foreign resource.
    #[error("{0} not found")]
    NotFound(String),
    /// Authentication failed.
    #[error("unauthorized")]
    Unauthorized,
    /// Malformed request or policy rejection.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Decision collaborator failure.
    #[error(transparent)]
    Decision(#[from] DecisionError),
    /// Persistence collaborator failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::PathTraversal => ErrorKind::PathTraversal,
            SandboxError::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            SandboxError::SandboxBusy(_) => ErrorKind::SandboxBusy,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::NotFound(_) => ErrorKind::NotFound,
            SandboxError::Unauthorized => ErrorKind::Unauthorized,
            SandboxError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SandboxError::Decision(_) => ErrorKind::Decision,
            SandboxError::Persistence(_) => ErrorKind::Persistence,
            SandboxError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            SandboxError::Io(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                ErrorKind::InvalidRequest
            }
            SandboxError::Io(_) | SandboxError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// A message safe to return to a remote caller.
    ///
    /// Variants that may carry host paths or internal details collapse to a
    /// generic sentence.
    pub fn safe_message(&self) -> String {
        match self {
            SandboxError::PathTraversal => "path escapes the workspace root".to_string(),
            SandboxError::SandboxUnavailable(_) => "workspace sandbox is unavailable".to_string(),
            SandboxError::SandboxBusy(n) => {
                format!("workspace is busy ({n} command(s) running), retry later")
            }
            SandboxError::Timeout(ms) => format!("timed out after {ms} ms"),
            SandboxError::NotFound(what) => format!("{what} not found"),
            SandboxError::Unauthorized => "unauthorized".to_string(),
            SandboxError::InvalidRequest(reason) => format!("invalid request: {reason}"),
            SandboxError::Decision(_) => "decision service failed".to_string(),
            SandboxError::Persistence(_) => "storage failure".to_string(),
            SandboxError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                "file not found".to_string()
            }
            SandboxError::Io(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                "invalid request: a parent of the path is not a directory".to_string()
            }
            SandboxError::Io(_) | SandboxError::Internal(_) => "internal error".to_string(),
        }
    }

    /// Structured, caller-facing rendering of this error.
    pub fn to_public(&self) -> PublicError {
        PublicError {
            kind: self.kind(),
            message: self.safe_message(),
        }
    }
}

/// The structured error shape returned to remote callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Safe, human-readable message.
    pub message: String,
}

/// Render untrusted input for logs: control characters escaped, length capped.
pub fn log_safe(raw: &str) -> String {
    const MAX: usize = 120;
    let mut out: String = raw.chars().take(MAX).flat_map(char::escape_debug).collect();
    if raw.chars().count() > MAX {
        out.push_str("...");
    }
    out
}
