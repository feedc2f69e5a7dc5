//! Error types for Zoneflow.
//!
//! Library crates use [`ZoneflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all Zoneflow operations.
///
/// Only `ConfigurationInvalid` is fatal; every other tool/merge variant is
/// recovered locally by the fallback manager or the result merger.
#[derive(Debug, thiserror::Error)]
pub enum ZoneflowError {
    /// The tool did not answer within its timeout.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// The tool ran but reported an error.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The resource manager refused a slot for the tool.
    #[error("tool '{tool}' unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    /// No capability entry exists for the zone's content type.
    #[error("content type '{content_type}' is not supported by any registered tool")]
    ContentTypeUnsupported { content_type: String },

    /// Candidates disagreed and no merged result could be produced.
    #[error("merge conflict unresolved for zone {zone_id}: {conflicts} conflict(s)")]
    MergeConflictUnresolved { zone_id: String, conflicts: usize },

    /// Configuration loading or validation error.
    #[error("invalid configuration: {message}")]
    ConfigurationInvalid { message: String },

    /// No run with the given id is known to the controller.
    #[error("unknown run: {0}")]
    UnknownRun(String),

    /// No zone with the given id exists in the run.
    #[error("unknown zone {zone_id} in run {run_id}")]
    UnknownZone { run_id: String, zone_id: String },

    /// The run was cancelled and accepts no further work.
    #[error("run {0} is cancelled")]
    RunCancelled(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input data validation error (zone file, tool output, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ZoneflowError>;

/// Serializable classification of a [`ZoneflowError`], stored in attempt
/// records and surfaced through the progress contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolTimeout,
    ToolExecutionError,
    ToolUnavailable,
    ContentTypeUnsupported,
    MergeConflictUnresolved,
    ConfigurationInvalid,
    InvalidRequest,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolTimeout => "tool_timeout",
            Self::ToolExecutionError => "tool_execution_error",
            Self::ToolUnavailable => "tool_unavailable",
            Self::ContentTypeUnsupported => "content_type_unsupported",
            Self::MergeConflictUnresolved => "merge_conflict_unresolved",
            Self::ConfigurationInvalid => "configuration_invalid",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ZoneflowError {
    /// Create a configuration error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for audit records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolTimeout { .. } => ErrorKind::ToolTimeout,
            Self::ToolExecution { .. } => ErrorKind::ToolExecutionError,
            Self::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            Self::ContentTypeUnsupported { .. } => ErrorKind::ContentTypeUnsupported,
            Self::MergeConflictUnresolved { .. } => ErrorKind::MergeConflictUnresolved,
            Self::ConfigurationInvalid { .. } | Self::Io { .. } => ErrorKind::ConfigurationInvalid,
            Self::UnknownRun(_) | Self::UnknownZone { .. } | Self::Validation { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::RunCancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the error must abort before a run starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConfigurationInvalid)
    }
}
