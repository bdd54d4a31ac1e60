//! Error types
//!
//! Expected outcomes (primary conflicts, duplicates) are carried inside
//! structured results; the enums here cover what callers branch on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Why a primary election or transfer was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryConflict {
    #[error("primary_exists")]
    PrimaryExists,
    #[error("not_current_primary")]
    NotCurrentPrimary,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionRestoreError {
    /// Nothing was ever recorded for the project
    #[error("no existing session for project {project_path}")]
    NoExistingSession { project_path: String },
    /// Metadata exists but lacks the external session handle
    #[error("invalid session metadata for project {project_path}")]
    InvalidSessionMetadata { project_path: String },
}

impl SessionRestoreError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionRestoreError::NoExistingSession { .. } => "no_existing_session",
            SessionRestoreError::InvalidSessionMetadata { .. } => "invalid_session_metadata",
        }
    }
}

/// Classification of a failed CLI turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessErrorKind {
    RateLimit,
    SessionExpired,
    PermissionDenied,
    Timeout,
    Unknown,
}

impl ProcessErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessErrorKind::RateLimit => "RATE_LIMIT",
            ProcessErrorKind::SessionExpired => "SESSION_EXPIRED",
            ProcessErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ProcessErrorKind::Timeout => "TIMEOUT",
            ProcessErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Worth retrying from the client side
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessErrorKind::Timeout | ProcessErrorKind::RateLimit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
}

impl ProcessError {
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Unexpected failure while folding CLI output
    pub fn parse_failure(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ProcessErrorKind::Unknown,
            format!("Failed to process Claude response: {}", detail),
        )
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} is closed")]
    Closed(String),
    #[error("device {device_id} is not primary for this session (primary: {primary_device_id})")]
    NotPrimary {
        device_id: String,
        primary_device_id: String,
    },
    #[error(transparent)]
    Restore(#[from] SessionRestoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
