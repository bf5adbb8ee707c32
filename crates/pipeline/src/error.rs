use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::job::JobState;

/// Failure taxonomy recorded on a job and reported through `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Empty, oversized, unreadable or missing source
    InvalidInput,
    /// Filename sanitized to nothing and no fallback is configured
    InvalidName,
    /// Filesystem, disk or permission failure
    ResourceUnavailable,
    /// The transcoder could not be started (operator-level)
    ToolUnavailable,
    /// Transcoder ran but did not produce a playlist with segments
    EncodeFailed,
    /// Thumbnail extraction failed (only ever degrades a Ready job)
    ThumbnailFailed,
    /// Exceeded the maximum processing time
    Timeout,
    /// Left unfinished by a previous process
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "InvalidInput",
            FailureKind::InvalidName => "InvalidName",
            FailureKind::ResourceUnavailable => "ResourceUnavailable",
            FailureKind::ToolUnavailable => "ToolUnavailable",
            FailureKind::EncodeFailed => "EncodeFailed",
            FailureKind::ThumbnailFailed => "ThumbnailFailed",
            FailureKind::Timeout => "Timeout",
            FailureKind::Interrupted => "Interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taxonomy code plus diagnostic text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Errors returned across the pipeline boundary
///
/// Per-job processing failures are not returned here; they are recorded on
/// the job and surface through `Pipeline::status`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid name: {0:?} has no usable characters")]
    InvalidName(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    #[error("invalid transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },
}

impl PipelineError {
    /// Taxonomy code for errors that correspond to a job failure kind
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PipelineError::InvalidInput(_) => Some(FailureKind::InvalidInput),
            PipelineError::InvalidName(_) => Some(FailureKind::InvalidName),
            PipelineError::ResourceUnavailable(_) => Some(FailureKind::ResourceUnavailable),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
