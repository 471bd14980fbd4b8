// ABOUTME: Error types for machine storage, file sandbox and lifecycle operations
// ABOUTME: Maps every failure into a machine-readable kind plus a human-readable detail

use crate::runtime::DriverError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Machine {0} has no container to stop")]
    NoContainer(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Path escapes the machine file root: {0}")]
    PathEscape(String),

    #[error("Container runtime error: {0}")]
    Driver(#[from] DriverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Machine record error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Upstream service error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, MachineError>;

/// Failure categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ValidationFailure,
    ToolFailure,
    ToolUnavailable,
    IoFailure,
    UpstreamFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::ValidationFailure => "validation_failure",
            Self::ToolFailure => "tool_failure",
            Self::ToolUnavailable => "tool_unavailable",
            Self::IoFailure => "io_failure",
            Self::UpstreamFailure => "upstream_failure",
        }
    }
}

impl MachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MachineNotFound(_) | Self::NoContainer(_) | Self::FileNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Validation(_) | Self::PathEscape(_) | Self::Archive(_) => {
                ErrorKind::ValidationFailure
            }
            Self::Driver(e) => match e {
                DriverError::Unavailable { .. } => ErrorKind::ToolUnavailable,
                DriverError::Io(_) => ErrorKind::IoFailure,
                DriverError::CommandFailed { .. } | DriverError::Parse(_) => {
                    ErrorKind::ToolFailure
                }
            },
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) | Self::Record(_) => ErrorKind::IoFailure,
            Self::Upstream(_) => ErrorKind::UpstreamFailure,
        }
    }

    pub(crate) fn path_escape(path: impl Into<PathBuf>) -> Self {
        Self::PathEscape(path.into().display().to_string())
    }
}
