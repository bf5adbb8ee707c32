use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{FailureKind, FailureReason};
use crate::owner::JobOwner;

/// Lifecycle state of a transcode job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Encoding,
    Thumbnailing,
    Ready,
    Failed,
}

impl JobState {
    /// Ready and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Failed)
    }

    /// Forward-only movement, or any non-terminal state to Failed
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Encoding) => true,
            (JobState::Encoding, JobState::Thumbnailing) => true,
            (JobState::Thumbnailing, JobState::Ready) => true,
            (current, JobState::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Result of one pipeline step, fed to [`next_state`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// The step failed but the job can still finish (thumbnail only)
    Degraded(FailureReason),
    Failed(FailureReason),
}

/// Compute the state that follows `current` given a step outcome
///
/// Returns `None` when the job is already terminal. A degraded outcome only
/// carries the job forward from `Thumbnailing`; anywhere else it is fatal.
pub fn next_state(current: JobState, outcome: &StepOutcome) -> Option<JobState> {
    if current.is_terminal() {
        return None;
    }

    let next = match (current, outcome) {
        (_, StepOutcome::Failed(_)) => JobState::Failed,
        (JobState::Thumbnailing, StepOutcome::Degraded(_)) => JobState::Ready,
        (_, StepOutcome::Degraded(_)) => JobState::Failed,
        (JobState::Pending, StepOutcome::Succeeded) => JobState::Encoding,
        (JobState::Encoding, StepOutcome::Succeeded) => JobState::Thumbnailing,
        (JobState::Thumbnailing, StepOutcome::Succeeded) => JobState::Ready,
        (JobState::Ready | JobState::Failed, _) => return None,
    };

    Some(next)
}

/// A state change requested of the job store, with the fields it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Encoding { source_bytes: u64 },
    Thumbnailing,
    Ready {
        playlist_url: String,
        thumbnail_url: Option<String>,
        thumbnail_error: Option<String>,
    },
    Failed(FailureReason),
}

impl JobUpdate {
    pub fn target_state(&self) -> JobState {
        match self {
            JobUpdate::Encoding { .. } => JobState::Encoding,
            JobUpdate::Thumbnailing => JobState::Thumbnailing,
            JobUpdate::Ready { .. } => JobState::Ready,
            JobUpdate::Failed(_) => JobState::Failed,
        }
    }
}

/// One transcoding request from submission to terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub original_filename: String,
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_bytes: Option<u64>,
    pub playlist_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub thumbnail_error: Option<String>,
    pub failure: Option<FailureReason>,
    /// Set once the source file has been handed to the remover
    pub source_released: bool,
    /// Process driving the job; snapshots from older runs have none
    #[serde(default)]
    pub owner: Option<JobOwner>,
}

impl Job {
    pub fn new(id: String, original_filename: String, source_path: PathBuf, output_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            original_filename,
            source_path,
            output_dir,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            source_bytes: None,
            playlist_url: None,
            thumbnail_url: None,
            thumbnail_error: None,
            failure: None,
            source_released: false,
            owner: None,
        }
    }

    /// Apply an update without checking reachability (the store does that)
    pub(crate) fn apply(&mut self, update: JobUpdate) {
        self.state = update.target_state();
        self.updated_at = Utc::now();

        match update {
            JobUpdate::Encoding { source_bytes } => {
                self.source_bytes = Some(source_bytes);
            }
            JobUpdate::Thumbnailing => {}
            JobUpdate::Ready { playlist_url, thumbnail_url, thumbnail_error } => {
                self.playlist_url = Some(playlist_url);
                self.thumbnail_url = thumbnail_url;
                self.thumbnail_error = thumbnail_error;
            }
            JobUpdate::Failed(reason) => {
                self.playlist_url = None;
                self.thumbnail_url = None;
                self.failure = Some(reason);
            }
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from(self)
    }
}

/// What a polling caller sees for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            playlist_url: job.playlist_url.clone(),
            thumbnail_url: job.thumbnail_url.clone(),
            failure: job.failure.clone(),
            updated_at: job.updated_at,
        }
    }
}
