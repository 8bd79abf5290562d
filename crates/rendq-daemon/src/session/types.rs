//! Render session and event hub types.

use serde::Serialize;

use rendq_core::progress::{OutputStream, ProgressSnapshot};

/// Configuration for the event hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-session broadcast channel capacity.
    pub session_capacity: usize,
    /// Queue-wide broadcast channel capacity.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_capacity: 256,
            queue_capacity: 1024,
        }
    }
}

/// Event emitted by a running render session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// One raw output line.
    Log { stream: OutputStream, line: String },
    /// The progress snapshot after a line changed it.
    Progress { snapshot: ProgressSnapshot },
    /// A line matched a fatal phrase.
    Critical { message: String },
    /// The process reported an error outside its output.
    Error { message: String },
    /// The process exited. Always the last event of a session.
    #[serde(rename_all = "camelCase")]
    Complete {
        exit_code: Option<i32>,
        cancelled: bool,
    },
}

/// A [`SessionEvent`] stamped with its per-session sequence number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub job_id: String,
    pub sequence: u64,
    pub event: SessionEvent,
}

/// How one render session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub job_id: String,
    pub process_id: String,
    /// `None` when the process died by signal or its status was lost.
    pub exit_code: Option<i32>,
    /// Termination was requested through the supervisor.
    pub cancelled: bool,
    /// Most recent line classified as critical.
    pub last_critical: Option<String>,
    /// Final progress state.
    pub snapshot: ProgressSnapshot,
    /// Unix milliseconds.
    pub started_at: i64,
    /// Unix milliseconds.
    pub finished_at: i64,
}

impl SessionOutcome {
    pub const fn succeeded(&self) -> bool {
        !self.cancelled && matches!(self.exit_code, Some(0))
    }

    /// Error text for a failed session, `None` if it succeeded or was cancelled.
    pub fn failure_message(&self) -> Option<String> {
        if self.cancelled || self.succeeded() {
            return None;
        }
        if let Some(critical) = &self.last_critical {
            return Some(critical.clone());
        }
        Some(match self.exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        })
    }
}

/// Event hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("No active session for job {job_id}")]
    SessionNotFound { job_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: Option<i32>, cancelled: bool, critical: Option<&str>) -> SessionOutcome {
        SessionOutcome {
            job_id: "job".to_string(),
            process_id: "proc".to_string(),
            exit_code,
            cancelled,
            last_critical: critical.map(str::to_string),
            snapshot: ProgressSnapshot::default(),
            started_at: 0,
            finished_at: 1,
        }
    }

    #[test]
    fn success_has_no_failure_message() {
        let o = outcome(Some(0), false, None);
        assert!(o.succeeded());
        assert_eq!(o.failure_message(), None);
    }

    #[test]
    fn cancellation_is_not_a_failure_even_with_nonzero_code() {
        let o = outcome(None, true, Some("Error: segmentation fault"));
        assert!(!o.succeeded());
        assert_eq!(o.failure_message(), None);
    }

    #[test]
    fn failure_prefers_last_critical_line() {
        let o = outcome(Some(1), false, Some("Error: Cannot render, no camera"));
        assert_eq!(
            o.failure_message().as_deref(),
            Some("Error: Cannot render, no camera")
        );
    }

    #[test]
    fn failure_falls_back_to_exit_code() {
        assert_eq!(
            outcome(Some(2), false, None).failure_message().as_deref(),
            Some("exited with code 2")
        );
        assert_eq!(
            outcome(None, false, None).failure_message().as_deref(),
            Some("terminated by signal")
        );
    }

    #[test]
    fn complete_event_serializes_camel_case() {
        let json = serde_json::to_value(SessionEvent::Complete {
            exit_code: Some(0),
            cancelled: false,
        })
        .unwrap_or_default();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["exitCode"], 0);
    }
}
