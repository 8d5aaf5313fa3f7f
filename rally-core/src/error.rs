//! Error types for the coordination service
//!
//! Every error that crosses the service boundary carries a kind from a
//! small closed set plus a coordination payload identifying the source
//! task, so recipients can tell service-generated errors apart from
//! task-reported ones.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskId;

/// Error kinds used at the service boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown task, participant mismatch, or malformed request
    InvalidArgument,
    /// Operation rejected in the current state
    FailedPrecondition,
    /// Key/value insert without overwrite on an existing key
    AlreadyExists,
    /// Key/value lookup miss
    NotFound,
    /// Incarnation mismatch or barrier aborted by shutdown
    Aborted,
    /// Heartbeat timeout
    Unavailable,
    /// Barrier deadline expired
    DeadlineExceeded,
    /// Explicit cancellation
    Cancelled,
    /// Service stopped or internal invariant violated
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::FailedPrecondition => "FailedPrecondition",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Aborted => "Aborted",
            ErrorCode::Unavailable => "Unavailable",
            ErrorCode::DeadlineExceeded => "DeadlineExceeded",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Coordination payload attached to every error
///
/// `source_task` is `None` for errors originated by the service itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Task whose failure produced this error, if any
    pub source_task: Option<TaskId>,
    /// True when the source task reported the error itself
    pub is_reported_error: bool,
}

/// Primary error type for all coordination operations
///
/// `Clone` because one barrier result fans out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CoordinationError {
    pub code: ErrorCode,
    pub message: String,
    pub payload: ErrorPayload,
}

impl CoordinationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: ErrorPayload::default(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attach the task whose failure produced this error
    pub fn with_source_task(mut self, task: TaskId) -> Self {
        self.payload.source_task = Some(task);
        self
    }

    /// Mark the error as reported by the source task itself
    pub fn reported_by_task(mut self) -> Self {
        self.payload.is_reported_error = true;
        self
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordinationError>;
