//! Database models for the rendq daemon.

use serde::{Deserialize, Serialize};

use rendq_core::RenderParameters;

/// Final status recorded in a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Cancelled,
}

impl HistoryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render history record from the database.
///
/// Written once when a job finishes and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub command: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: i64,
    pub progress: f64,
    pub current_frame: i64,
    pub total_frames: i64,
    pub current_sample: i64,
    pub total_samples: i64,
    pub peak_memory: f64,
    pub error: Option<String>,
    /// JSON-encoded [`RenderParameters`] snapshot.
    pub parameters: Option<String>,
}

impl HistoryRecord {
    /// Typed status, if the stored value is recognised.
    pub fn status(&self) -> Option<HistoryStatus> {
        HistoryStatus::parse(&self.status)
    }

    /// Decoded parameter snapshot.
    pub fn parameters(&self) -> Option<RenderParameters> {
        self.parameters
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
    }
}
