//! Queue data model and events.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use rendq_core::progress::ProgressSnapshot;
use rendq_core::{FrameRange, QueueSettings, RenderParameters};

use crate::session::SessionMessage;
use crate::storage::{DatabaseError, HistoryRecord};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has not started yet and may be edited.
    pub const fn is_editable(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }

    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued render request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub command: String,
    /// Higher runs sooner.
    pub priority: i32,
    pub dependencies: BTreeSet<String>,
    /// Earliest dispatch time, Unix milliseconds.
    pub scheduled_at: Option<i64>,
    pub status: JobStatus,
    /// Set when a run is cancelled. A held job is skipped by dispatch until
    /// it is released or edited.
    #[serde(default)]
    pub held: bool,
    pub frame_range: FrameRange,
    pub progress: ProgressSnapshot,
    pub parameters: Option<RenderParameters>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    /// Frame range for a command, preferring the parameter snapshot.
    pub fn resolve_frame_range(command: &str, parameters: Option<&RenderParameters>) -> FrameRange {
        parameters
            .map(RenderParameters::frame_range)
            .or_else(|| FrameRange::from_command(command))
            .unwrap_or_default()
    }

    /// Clear run state so the job can be dispatched again.
    pub(crate) fn reset_run_state(&mut self) {
        self.progress = ProgressSnapshot::for_range(self.frame_range);
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Request to add a job. Either `command` or `parameters` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobSpec {
    pub name: Option<String>,
    /// Explicit invocation string. Takes precedence over `parameters`.
    pub command: Option<String>,
    pub parameters: Option<RenderParameters>,
    /// Defaults to the queue's default priority.
    pub priority: Option<i32>,
    pub dependencies: BTreeSet<String>,
    pub scheduled_at: Option<i64>,
}

impl JobSpec {
    /// Spec for a raw invocation string.
    pub fn from_command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Spec for a parameter set; the command is assembled when added.
    pub fn from_parameters(parameters: RenderParameters) -> Self {
        Self {
            parameters: Some(parameters),
            ..Self::default()
        }
    }

    /// Display name: explicit, else the blend file stem, else the command.
    pub(crate) fn display_name(&self, command: &str) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        if let Some(stem) = self
            .parameters
            .as_ref()
            .and_then(|p| Path::new(&p.blend_file).file_stem())
        {
            return stem.to_string_lossy().into_owned();
        }
        command.chars().take(60).collect()
    }
}

/// Partial update for a not-yet-started job. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobUpdate {
    pub name: Option<String>,
    pub command: Option<String>,
    /// New parameters. The command is re-assembled unless `command` is also set.
    pub parameters: Option<RenderParameters>,
    pub priority: Option<i32>,
    pub dependencies: Option<BTreeSet<String>>,
    /// `Some(None)` clears the schedule time.
    pub scheduled_at: Option<Option<i64>>,
}

/// Notification published to UI listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueEvent {
    JobAdded { job: Box<Job> },
    JobUpdated { job: Box<Job> },
    #[serde(rename_all = "camelCase")]
    JobRemoved { job_id: String },
    /// A job reached a terminal transition: completed, failed, or cancelled
    /// back to pending.
    #[serde(rename_all = "camelCase")]
    JobFinished {
        job_id: String,
        status: JobStatus,
        cancelled: bool,
        error: Option<String>,
    },
    HistoryRecorded { record: Box<HistoryRecord> },
    /// Event from a running render session.
    Session(SessionMessage),
    SettingsChanged { settings: QueueSettings },
    ProcessingChanged { processing: bool },
}

/// Queue operation errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is {status} and can no longer be edited")]
    NotEditable { job_id: String, status: JobStatus },

    #[error("Job {job_id} is running")]
    JobRunning { job_id: String },

    #[error("Job {job_id} is {status}, only failed jobs can be retried")]
    NotRetryable { job_id: String, status: JobStatus },

    #[error("Invalid dependency for job {job_id}: {reason}")]
    InvalidDependency { job_id: String, reason: String },

    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}
